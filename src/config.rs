//! Database dialect configuration.
//!
//! A config encapsulates the database-specific text shaping the renderer
//! cannot decide on its own: the final form of `@LIKE` clauses, the
//! pagination suffix for `@OFFSETFETCH`, the whole-query rewrite for
//! `@PAGING`, and per-line pre-processing at parse time. The parser and
//! renderer depend only on this trait.

/// Sentinel meaning "no fetch limit". A fetch of `0` is treated the same
/// way.
pub const FETCH_UNLIMITED: i64 = i64::MAX;

fn fetch_limited(fetch: i64) -> bool {
    fetch != 0 && fetch != FETCH_UNLIMITED
}

/// Trait for database-specific SQL text shaping.
pub trait ElSqlConfig: Send + Sync {
    /// Returns the config name, used only to select an override resource
    /// file (`<name>-<config-name>.elsql`).
    fn name(&self) -> &'static str;

    /// Returns the final text of a `@LIKE .. @ENDLIKE` region given its
    /// already-rendered body.
    fn format_like(&self, body_sql: &str) -> String {
        format!("LIKE {}", body_sql)
    }

    /// Returns the pagination suffix for an offset/fetch pair.
    ///
    /// An offset of `0` omits the offset clause; a fetch of `0` or
    /// [`FETCH_UNLIMITED`] omits the fetch clause.
    fn offset_fetch(&self, offset: i64, fetch: i64) -> String {
        let mut out = String::new();
        if offset > 0 {
            out.push_str(&format!("OFFSET {} ROWS ", offset));
        }
        if fetch_limited(fetch) {
            out.push_str(&format!("FETCH NEXT {} ROWS ONLY ", fetch));
        }
        out
    }

    /// Rewrites a complete query body to apply pagination.
    fn paging(&self, offset: i64, fetch: i64, body_sql: &str) -> String {
        format!("{}{}", body_sql, self.offset_fetch(offset, fetch))
    }

    /// Pre-processing applied by the parser to each SQL source line.
    fn format_line(&self, raw: &str) -> String {
        raw.trim_end().to_string()
    }
}

fn limit_offset(offset: i64, fetch: i64) -> String {
    let mut out = String::new();
    if fetch_limited(fetch) {
        out.push_str(&format!("LIMIT {} ", fetch));
    }
    if offset > 0 {
        out.push_str(&format!("OFFSET {} ", offset));
    }
    out
}

/// The ANSI SQL:2008 config, using `OFFSET .. ROWS FETCH NEXT .. ROWS ONLY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl ElSqlConfig for DefaultConfig {
    fn name(&self) -> &'static str {
        "Default"
    }
}

/// PostgreSQL, paginating with `LIMIT .. OFFSET ..`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConfig;

impl ElSqlConfig for PostgresConfig {
    fn name(&self) -> &'static str {
        "Postgres"
    }

    fn offset_fetch(&self, offset: i64, fetch: i64) -> String {
        limit_offset(offset, fetch)
    }
}

/// Vertica follows the PostgreSQL pagination syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerticaConfig;

impl ElSqlConfig for VerticaConfig {
    fn name(&self) -> &'static str {
        "Vertica"
    }

    fn offset_fetch(&self, offset: i64, fetch: i64) -> String {
        limit_offset(offset, fetch)
    }
}

/// MySQL. `OFFSET` is only valid after a `LIMIT`, so an offset without a
/// fetch limit uses the documented all-rows limit value.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConfig;

impl ElSqlConfig for MySqlConfig {
    fn name(&self) -> &'static str {
        "MySql"
    }

    fn offset_fetch(&self, offset: i64, fetch: i64) -> String {
        if !fetch_limited(fetch) && offset > 0 {
            return format!("LIMIT 18446744073709551615 OFFSET {} ", offset);
        }
        limit_offset(offset, fetch)
    }
}

/// HSQLDB. Pagination follows PostgreSQL; LIKE clauses carry an explicit
/// escape character.
#[derive(Debug, Clone, Copy, Default)]
pub struct HsqlConfig;

impl ElSqlConfig for HsqlConfig {
    fn name(&self) -> &'static str {
        "Hsql"
    }

    fn format_like(&self, body_sql: &str) -> String {
        format!("LIKE {}ESCAPE '\\' ", body_sql)
    }

    fn offset_fetch(&self, offset: i64, fetch: i64) -> String {
        limit_offset(offset, fetch)
    }
}

/// Oracle. `@OFFSETFETCH` emits the 12c `OFFSET/FETCH` syntax; `@PAGING`
/// wraps the whole query in the classic nested `ROWNUM` select for older
/// servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleConfig;

impl ElSqlConfig for OracleConfig {
    fn name(&self) -> &'static str {
        "Oracle"
    }

    fn paging(&self, offset: i64, fetch: i64, body_sql: &str) -> String {
        if offset == 0 && !fetch_limited(fetch) {
            return body_sql.to_string();
        }
        if offset == 0 {
            return format!("SELECT * FROM ( {}) WHERE ROWNUM <= {} ", body_sql, fetch);
        }
        if !fetch_limited(fetch) {
            return format!(
                "SELECT * FROM ( SELECT row_.*, ROWNUM row_nr FROM ( {}) row_ ) WHERE row_nr > {} ",
                body_sql, offset
            );
        }
        format!(
            "SELECT * FROM ( SELECT row_.*, ROWNUM row_nr FROM ( {}) row_ WHERE ROWNUM <= {} ) WHERE row_nr > {} ",
            body_sql,
            offset + fetch,
            offset
        )
    }
}
