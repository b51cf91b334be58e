/*!
Graph store adapter (Neo4j HTTP transaction API).

The whole graph is one capture unit: a bulk export of all nodes and
relationships as newline-delimited JSON, plus the index/constraint definitions
captured as replayable statements in `schema.cypher`.

Restore wipes the graph unconditionally, bulk-recreates nodes and
relationships through a transient import id, and only then replays the schema
statements. Index-after-data mirrors the deployment's established restore
order; see DESIGN.md before changing it. The wipe removes data only, so
schema statements whose rule already exists are skipped rather than treated
as failures; a restore re-run stays safe.
*/

use super::{Cardinality, StoreAdapter};
use crate::config::GraphConfig;
use crate::metadata::{StoreKind, StoreManifest, UnitRecord};
use crate::{Result, VaultError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const NODES_FILE: &str = "nodes.ndjson";
const RELATIONSHIPS_FILE: &str = "relationships.ndjson";
const SCHEMA_FILE: &str = "schema.cypher";

/// The single capture unit the graph store exposes.
pub const GRAPH_UNIT: &str = "graph";

/// Transient label and property used to rewire relationships during import.
const IMPORT_LABEL: &str = "__MemvaultImport";
const IMPORT_ID: &str = "__memvault_id";

const WIPE_BATCH: u64 = 5_000;
const IMPORT_BATCH: usize = 500;

#[derive(Serialize, Deserialize)]
struct NodeRow {
    id: i64,
    labels: Vec<String>,
    props: Value,
}

#[derive(Serialize, Deserialize)]
struct RelationshipRow {
    id: i64,
    rel_type: String,
    start: i64,
    end: i64,
    props: Value,
}

#[derive(Deserialize)]
struct TxResponse {
    results: Vec<TxResult>,
    errors: Vec<TxError>,
}

#[derive(Deserialize)]
struct TxResult {
    data: Vec<TxRow>,
}

#[derive(Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// Neo4j-backed implementation of [`StoreAdapter`].
pub struct GraphAdapter {
    config: GraphConfig,
    client: Client,
}

impl GraphAdapter {
    pub fn new(config: GraphConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self { config, client })
    }

    /// Run one statement through the transaction-commit endpoint and return
    /// its rows.
    async fn cypher(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>> {
        let url = format!(
            "{}/db/{}/tx/commit",
            self.config.url.trim_end_matches('/'),
            self.config.database
        );
        let body = json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::Service(format!(
                "graph store returned {status}: {}",
                text.trim()
            )));
        }

        let parsed: TxResponse = response.json().await?;
        if let Some(err) = parsed.errors.first() {
            return Err(VaultError::Service(format!(
                "cypher failed ({}): {}",
                err.code, err.message
            )));
        }
        Ok(parsed
            .results
            .into_iter()
            .next()
            .map(|r| r.data.into_iter().map(|d| d.row).collect())
            .unwrap_or_default())
    }

    async fn count(&self, statement: &str) -> Result<u64> {
        let rows = self.cypher(statement, json!({})).await?;
        rows.first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .ok_or_else(|| VaultError::validation(format!("no count returned by: {statement}")))
    }

    async fn export_nodes(&self, dest: &Path) -> Result<u64> {
        let rows = self
            .cypher(
                "MATCH (n) RETURN id(n) AS id, labels(n) AS labels, properties(n) AS props",
                json!({}),
            )
            .await?;
        let mut file = fs::File::create(dest)?;
        let count = rows.len() as u64;
        for row in rows {
            let node = NodeRow {
                id: row
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| VaultError::capture(GRAPH_UNIT, "node export missing id"))?,
                labels: serde_json::from_value(row.get(1).cloned().unwrap_or(Value::Null))?,
                props: row.get(2).cloned().unwrap_or_else(|| json!({})),
            };
            writeln!(file, "{}", serde_json::to_string(&node)?)?;
        }
        Ok(count)
    }

    async fn export_relationships(&self, dest: &Path) -> Result<u64> {
        let rows = self
            .cypher(
                "MATCH (a)-[r]->(b) RETURN id(r) AS id, type(r) AS rel_type, \
                 id(a) AS start, id(b) AS end, properties(r) AS props",
                json!({}),
            )
            .await?;
        let mut file = fs::File::create(dest)?;
        let count = rows.len() as u64;
        for row in rows {
            let rel = RelationshipRow {
                id: row
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| VaultError::capture(GRAPH_UNIT, "relationship export missing id"))?,
                rel_type: row
                    .get(1)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| VaultError::capture(GRAPH_UNIT, "relationship export missing type"))?,
                start: row.get(2).and_then(Value::as_i64).unwrap_or_default(),
                end: row.get(3).and_then(Value::as_i64).unwrap_or_default(),
                props: row.get(4).cloned().unwrap_or_else(|| json!({})),
            };
            writeln!(file, "{}", serde_json::to_string(&rel)?)?;
        }
        Ok(count)
    }

    /// Capture index and constraint definitions as replayable statements.
    async fn export_schema(&self, dest: &Path) -> Result<()> {
        let mut statements = Vec::new();
        for query in [
            "SHOW INDEXES YIELD createStatement RETURN createStatement",
            "SHOW CONSTRAINTS YIELD createStatement RETURN createStatement",
        ] {
            for row in self.cypher(query, json!({})).await? {
                if let Some(statement) = row.first().and_then(Value::as_str) {
                    statements.push(statement.to_string());
                }
            }
        }
        fs::write(dest, statements.join("\n"))?;
        Ok(())
    }

    /// Delete all nodes and relationships in bounded batches.
    async fn wipe(&self) -> Result<()> {
        loop {
            let deleted = self
                .count(&format!(
                    "MATCH (n) WITH n LIMIT {WIPE_BATCH} DETACH DELETE n RETURN count(*)"
                ))
                .await?;
            debug!(deleted, "graph wipe batch");
            if deleted == 0 {
                return Ok(());
            }
        }
    }

    fn label_fragment(labels: &[String]) -> String {
        labels
            .iter()
            .map(|l| format!(":`{}`", l.replace('`', "``")))
            .collect()
    }

    async fn import_nodes(&self, src: &Path) -> Result<()> {
        let reader = BufReader::new(fs::File::open(src)?);
        // Grouped by label set: one CREATE statement shape per group.
        let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let node: NodeRow = serde_json::from_str(&line)?;
            let mut labels = node.labels.clone();
            labels.sort();
            groups
                .entry(Self::label_fragment(&labels))
                .or_default()
                .push(json!({ "id": node.id, "props": node.props }));
        }

        for (fragment, rows) in groups {
            let statement = format!(
                "UNWIND $rows AS row CREATE (n:`{IMPORT_LABEL}`{fragment}) \
                 SET n = row.props SET n.{IMPORT_ID} = row.id"
            );
            for batch in rows.chunks(IMPORT_BATCH) {
                self.cypher(&statement, json!({ "rows": batch })).await?;
            }
        }
        Ok(())
    }

    async fn import_relationships(&self, src: &Path) -> Result<()> {
        let reader = BufReader::new(fs::File::open(src)?);
        let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let rel: RelationshipRow = serde_json::from_str(&line)?;
            groups.entry(rel.rel_type.clone()).or_default().push(json!({
                "start": rel.start,
                "end": rel.end,
                "props": rel.props,
            }));
        }

        for (rel_type, rows) in groups {
            let statement = format!(
                "UNWIND $rows AS row \
                 MATCH (a:`{IMPORT_LABEL}` {{{IMPORT_ID}: row.start}}) \
                 MATCH (b:`{IMPORT_LABEL}` {{{IMPORT_ID}: row.end}}) \
                 CREATE (a)-[r:`{}`]->(b) SET r = row.props",
                rel_type.replace('`', "``")
            );
            for batch in rows.chunks(IMPORT_BATCH) {
                self.cypher(&statement, json!({ "rows": batch })).await?;
            }
        }
        Ok(())
    }

    /// True when a cypher error reports a schema rule that already exists.
    /// `wipe` removes data only, so indexes and constraints from before the
    /// restore survive and their create statements must not fail the run.
    fn is_existing_schema_rule(error: &VaultError) -> bool {
        match error {
            VaultError::Service(message) => {
                message.contains("Neo.ClientError.Schema.") && message.contains("AlreadyExists")
            }
            _ => false,
        }
    }

    async fn replay_schema(&self, src: &Path) -> Result<()> {
        let content = fs::read_to_string(src)?;
        for statement in content.lines().filter(|l| !l.trim().is_empty()) {
            match self.cypher(statement, json!({})).await {
                Ok(_) => {}
                Err(e) if Self::is_existing_schema_rule(&e) => {
                    debug!(statement, "schema rule already present, skipping");
                }
                Err(e) => return Err(VaultError::restore(GRAPH_UNIT, e.to_string())),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for GraphAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Graph
    }

    async fn discover(&self) -> Result<Vec<String>> {
        Ok(vec![GRAPH_UNIT.to_string()])
    }

    async fn capture(&self, dest: &Path) -> Result<StoreManifest> {
        fs::create_dir_all(dest)?;
        let mut manifest = StoreManifest::new(StoreKind::Graph);
        let dir = StoreKind::Graph.dir_name();

        let result = async {
            let nodes = self.export_nodes(&dest.join(NODES_FILE)).await?;
            let relationships = self
                .export_relationships(&dest.join(RELATIONSHIPS_FILE))
                .await?;
            self.export_schema(&dest.join(SCHEMA_FILE)).await?;
            info!(nodes, relationships, "graph exported");
            Ok::<(), VaultError>(())
        }
        .await;

        match result {
            Ok(()) => manifest.push(UnitRecord::captured(
                GRAPH_UNIT,
                vec![
                    format!("{dir}/{NODES_FILE}"),
                    format!("{dir}/{RELATIONSHIPS_FILE}"),
                    format!("{dir}/{SCHEMA_FILE}"),
                ],
            )),
            Err(e) => {
                warn!(error = %e, "graph export failed");
                manifest.push(UnitRecord::failed(GRAPH_UNIT, e.to_string()));
            }
        }
        Ok(manifest)
    }

    async fn restore(&self, src: &Path, manifest: &StoreManifest) -> Result<()> {
        let Some(unit) = manifest.captured_units().find(|u| u.name == GRAPH_UNIT) else {
            return Ok(());
        };
        let root = src.join(StoreKind::Graph.dir_name());
        let map_err = |e: VaultError| VaultError::restore(GRAPH_UNIT, e.to_string());

        // Graph restore is explicitly destructive and non-incremental.
        self.wipe().await.map_err(map_err)?;

        self.cypher(
            &format!(
                "CREATE INDEX memvault_import_id IF NOT EXISTS \
                 FOR (n:`{IMPORT_LABEL}`) ON (n.{IMPORT_ID})"
            ),
            json!({}),
        )
        .await
        .map_err(map_err)?;

        self.import_nodes(&root.join(NODES_FILE)).await.map_err(map_err)?;
        self.import_relationships(&root.join(RELATIONSHIPS_FILE))
            .await
            .map_err(map_err)?;

        // Drop the import scaffolding before the schema replay.
        self.cypher(
            &format!("MATCH (n:`{IMPORT_LABEL}`) REMOVE n.{IMPORT_ID}, n:`{IMPORT_LABEL}`"),
            json!({}),
        )
        .await
        .map_err(map_err)?;
        self.cypher("DROP INDEX memvault_import_id IF EXISTS", json!({}))
            .await
            .map_err(map_err)?;

        // Indexes and constraints are replayed after the data load, matching
        // the restore order the deployment has always used.
        self.replay_schema(&root.join(SCHEMA_FILE)).await?;

        info!(unit = %unit.name, "graph restored");
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.count("MATCH (n) RETURN count(n)").await? == 0)
    }

    async fn probe(&self) -> Result<()> {
        self.cypher("RETURN 1", json!({})).await.map(|_| ())
    }

    async fn cardinality(&self) -> Result<Vec<Cardinality>> {
        Ok(vec![
            Cardinality::new(
                GRAPH_UNIT,
                "nodes",
                self.count("MATCH (n) RETURN count(n)").await?,
            ),
            Cardinality::new(
                GRAPH_UNIT,
                "relationships",
                self.count("MATCH ()-[r]->() RETURN count(r)").await?,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_fragment_escapes_backticks() {
        let labels = vec!["Person".to_string(), "we`ird".to_string()];
        assert_eq!(
            GraphAdapter::label_fragment(&labels),
            ":`Person`:`we``ird`"
        );
    }

    #[test]
    fn test_existing_schema_rules_are_tolerated() {
        let existing = VaultError::Service(
            "cypher failed (Neo.ClientError.Schema.EquivalentSchemaRuleAlreadyExists): \
             An equivalent index already exists"
                .to_string(),
        );
        assert!(GraphAdapter::is_existing_schema_rule(&existing));

        let syntax = VaultError::Service(
            "cypher failed (Neo.ClientError.Statement.SyntaxError): Invalid input".to_string(),
        );
        assert!(!GraphAdapter::is_existing_schema_rule(&syntax));
        assert!(!GraphAdapter::is_existing_schema_rule(&VaultError::Cancelled));
    }

    #[test]
    fn test_node_row_roundtrip() {
        let node = NodeRow {
            id: 42,
            labels: vec!["Memory".to_string()],
            props: json!({ "text": "hello" }),
        };
        let line = serde_json::to_string(&node).unwrap();
        let back: NodeRow = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, 42);
        assert_eq!(back.labels, vec!["Memory"]);
        assert_eq!(back.props, json!({ "text": "hello" }));
    }
}
