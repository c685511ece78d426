mod bundle;
mod config;
mod error;
mod fragment;
mod params;
mod parser;
mod render;

// Public exports; the fragment tree itself stays internal.
pub use bundle::ElSqlBundle;
pub use config::{
    DefaultConfig, ElSqlConfig, HsqlConfig, MySqlConfig, OracleConfig, PostgresConfig,
    VerticaConfig, FETCH_UNLIMITED,
};
pub use error::{ElSqlError, ElSqlResult, ParseError};
pub use params::{EmptyParams, MapParams, SqlParams, SqlValue};
