//! Relationship edge repository.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use papertrail_core::{EdgeKind, EdgeRepository, Error, RelationshipEdge, Result};

pub struct PgEdgeRepository {
    pool: Pool<Postgres>,
}

impl PgEdgeRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn row_to_edge(row: &PgRow) -> Result<RelationshipEdge> {
    let kind: String = row.try_get("kind")?;
    Ok(RelationshipEdge::new(
        row.try_get::<String, _>("item_a")?,
        row.try_get::<String, _>("item_b")?,
        kind.parse::<EdgeKind>()?,
        row.try_get("weight")?,
    ))
}

#[async_trait]
impl EdgeRepository for PgEdgeRepository {
    async fn upsert(&self, edge: &RelationshipEdge) -> Result<()> {
        // Canonical endpoint order, matching the table's CHECK constraint.
        let edge = RelationshipEdge::new(
            edge.item_a.clone(),
            edge.item_b.clone(),
            edge.kind,
            edge.weight,
        );
        sqlx::query(
            "INSERT INTO relationship_edge (item_a, item_b, kind, weight, updated_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (item_a, item_b, kind)
             DO UPDATE SET weight = EXCLUDED.weight, updated_at = NOW()",
        )
        .bind(&edge.item_a)
        .bind(&edge.item_b)
        .bind(edge.kind.as_str())
        .bind(edge.weight)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn edges_for(&self, item_id: &str) -> Result<Vec<RelationshipEdge>> {
        let rows = sqlx::query(
            "SELECT item_a, item_b, kind, weight FROM relationship_edge
             WHERE item_a = $1 OR item_b = $1
             ORDER BY weight DESC, item_a, item_b",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(row_to_edge).collect()
    }

    async fn list(&self) -> Result<Vec<RelationshipEdge>> {
        let rows = sqlx::query(
            "SELECT item_a, item_b, kind, weight FROM relationship_edge
             ORDER BY item_a, item_b, kind",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(row_to_edge).collect()
    }
}
