//! Bank layout template cache operations

use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::{BankLayoutTemplate, ParseConfig};

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<BankLayoutTemplate> {
    let fingerprint: String = row.get(1)?;
    let config_json: String = row.get(3)?;
    let last_used_at: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;

    let parse_config = serde_json::from_str(&config_json).unwrap_or_else(|e| {
        warn!(fingerprint = %fingerprint, error = %e, "Stored parse config is not valid JSON");
        ParseConfig::default()
    });

    Ok(BankLayoutTemplate {
        id: row.get(0)?,
        fingerprint,
        bank_name_guess: row.get(2)?,
        parse_config,
        use_count: row.get(4)?,
        last_used_at: last_used_at.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_at),
    })
}

impl Database {
    /// Exact fingerprint lookup
    pub fn get_layout_template(&self, fingerprint: &str) -> Result<Option<BankLayoutTemplate>> {
        let conn = self.conn()?;
        let template = conn
            .query_row(
                r#"
                SELECT id, fingerprint, bank_name_guess, parse_config, use_count,
                       last_used_at, created_at
                FROM bank_layout_templates WHERE fingerprint = ?
                "#,
                params![fingerprint],
                row_to_template,
            )
            .optional()?;
        Ok(template)
    }

    /// Store a layout. An existing fingerprint keeps its original config.
    ///
    /// Returns true if a new template was inserted.
    pub fn save_layout_template(
        &self,
        fingerprint: &str,
        bank_name_guess: Option<&str>,
        parse_config: &ParseConfig,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let config_json = serde_json::to_string(parse_config)?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO bank_layout_templates (fingerprint, bank_name_guess, parse_config)
            VALUES (?, ?, ?)
            "#,
            params![fingerprint, bank_name_guess, config_json],
        )?;
        Ok(inserted > 0)
    }

    /// Record a cache hit
    pub fn touch_layout_template(&self, fingerprint: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE bank_layout_templates
            SET use_count = use_count + 1, last_used_at = CURRENT_TIMESTAMP
            WHERE fingerprint = ?
            "#,
            params![fingerprint],
        )?;
        Ok(())
    }

    pub fn list_layout_templates(&self) -> Result<Vec<BankLayoutTemplate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, fingerprint, bank_name_guess, parse_config, use_count,
                   last_used_at, created_at
            FROM bank_layout_templates
            ORDER BY created_at DESC, id DESC
            "#,
        )?;

        let templates = stmt
            .query_map([], row_to_template)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    /// Returns true if a template was removed
    pub fn delete_layout_template(&self, fingerprint: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM bank_layout_templates WHERE fingerprint = ?",
            params![fingerprint],
        )?;
        Ok(deleted > 0)
    }
}
