use std::fs;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::config::ElSqlConfig;
use crate::error::{ElSqlError, ElSqlResult};
use crate::fragment::Fragment;
use crate::params::{EmptyParams, SqlParams};
use crate::parser::parse_resource;
use crate::render::SqlRenderer;

/// A bundle of elsql formatted SQL.
///
/// A bundle encapsulates the SQL needed for one feature, typically a data
/// access object or a set of related tables. It is immutable once built:
/// concurrent renders against a shared bundle are safe without locks,
/// provided the supplied parameter source is itself safe to read
/// concurrently.
///
/// # Examples
///
/// ```
/// use elsql::{DefaultConfig, ElSqlBundle, MapParams};
///
/// let source = "@NAME(SelectPerson)\n  SELECT * FROM person\n  @WHERE\n    @AND(:surname)\n      surname = :surname\n";
/// let bundle = ElSqlBundle::parse(DefaultConfig, &[source]).unwrap();
///
/// let mut params = MapParams::new();
/// params.insert("surname", "Doe");
/// let sql = bundle.get_sql_params("SelectPerson", &params).unwrap();
/// assert_eq!(sql.trim(), "SELECT * FROM person WHERE surname = Doe");
/// ```
#[derive(Clone)]
pub struct ElSqlBundle {
    fragments: Arc<IndexMap<String, Fragment>>,
    config: Arc<dyn ElSqlConfig>,
}

impl std::fmt::Debug for ElSqlBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElSqlBundle")
            .field("fragments", &self.fragments)
            .field("config", &self.config.name())
            .finish()
    }
}

impl ElSqlBundle {
    /// Loads a bundle from `.elsql` files in a directory.
    ///
    /// Two files are considered: the mandatory base `<name>.elsql`, and an
    /// optional dialect override `<name>-<config name>.elsql` layered on
    /// top of it. Named blocks in the override replace same-named blocks
    /// in the base; the config is designed to handle some, but not all,
    /// database differences, and the override file covers the rest.
    pub fn of<C>(config: C, dir: impl AsRef<Path>, name: &str) -> ElSqlResult<Self>
    where
        C: ElSqlConfig + 'static,
    {
        let dir = dir.as_ref();
        let base = dir.join(format!("{}.elsql", name));
        if !base.is_file() {
            return Err(ElSqlError::ResourceNotFound { path: base });
        }
        let override_path = dir.join(format!("{}-{}.elsql", name, config.name()));
        let mut sources = vec![fs::read_to_string(&base)?];
        if override_path.is_file() {
            debug!(path = %override_path.display(), "Loading dialect override resource");
            sources.push(fs::read_to_string(&override_path)?);
        }
        debug!(path = %base.display(), "Loading elsql resource");
        Self::build(Arc::new(config), &sources)
    }

    /// Parses a bundle from layered resource texts.
    ///
    /// Named blocks in later resources override blocks with the same name
    /// in earlier resources.
    pub fn parse<C, S>(config: C, resources: &[S]) -> ElSqlResult<Self>
    where
        C: ElSqlConfig + 'static,
        S: AsRef<str>,
    {
        Self::build(Arc::new(config), resources)
    }

    fn build<S: AsRef<str>>(
        config: Arc<dyn ElSqlConfig>,
        resources: &[S],
    ) -> ElSqlResult<Self> {
        let mut fragments = IndexMap::new();
        for (index, resource) in resources.iter().enumerate() {
            let parsed = parse_resource(&*config, index, resource.as_ref())?;
            fragments.extend(parsed);
        }
        debug!(fragments = fragments.len(), config = config.name(), "Parsed elsql bundle");
        Ok(ElSqlBundle {
            fragments: Arc::new(fragments),
            config,
        })
    }

    /// The active dialect config.
    pub fn config(&self) -> &dyn ElSqlConfig {
        &*self.config
    }

    /// Returns a copy of this bundle with a different config.
    ///
    /// The fragment map is shared; the underlying resources are not
    /// re-read.
    pub fn with_config<C>(&self, config: C) -> Self
    where
        C: ElSqlConfig + 'static,
    {
        ElSqlBundle {
            fragments: Arc::clone(&self.fragments),
            config: Arc::new(config),
        }
    }

    /// Finds and renders a named fragment without parameters.
    ///
    /// Any directive in the fragment that needs a variable will fail with
    /// [`ElSqlError::MissingVariable`].
    pub fn get_sql(&self, name: &str) -> ElSqlResult<String> {
        self.get_sql_params(name, &EmptyParams)
    }

    /// Finds and renders a named fragment against a parameter source.
    pub fn get_sql_params(&self, name: &str, params: &dyn SqlParams) -> ElSqlResult<String> {
        let mut buf = String::with_capacity(1024);
        SqlRenderer::new(self, params).render_named(name, &mut buf)?;
        debug!(name = %name, sql = %buf, "Rendered fragment");
        Ok(buf)
    }

    /// Names of all fragments in the bundle, in definition order.
    pub fn fragment_names(&self) -> impl Iterator<Item = &str> {
        self.fragments.keys().map(String::as_str)
    }

    pub(crate) fn fragment(&self, name: &str) -> ElSqlResult<&Fragment> {
        self.fragments
            .get(name)
            .ok_or_else(|| ElSqlError::UnknownFragment {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultConfig, HsqlConfig, OracleConfig, PostgresConfig};
    use crate::params::MapParams;

    /// Collapses whitespace runs so assertions are not hostage to the
    /// single-trailing-space layout of rendered lines.
    fn canon(sql: &str) -> String {
        sql.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn bundle(source: &str) -> ElSqlBundle {
        ElSqlBundle::parse(DefaultConfig, &[source]).expect("parse failed")
    }

    #[test]
    fn basic_named_fragment() {
        let bundle = bundle("@NAME(Sel)\n  SELECT 1\n");
        assert_eq!(canon(&bundle.get_sql("Sel").unwrap()), "SELECT 1");
    }

    #[test]
    fn unknown_fragment_name() {
        let bundle = bundle("@NAME(Sel)\n  SELECT 1\n");
        let err = bundle.get_sql("Nope").unwrap_err();
        assert!(matches!(err, ElSqlError::UnknownFragment { name } if name == "Nope"));
    }

    #[test]
    fn where_elided_when_variable_absent() {
        let bundle = bundle(
            "@NAME(Sel)\n  SELECT * FROM t\n  @WHERE\n    @AND(:a)\n      a = :a\n",
        );
        assert_eq!(canon(&bundle.get_sql("Sel").unwrap()), "SELECT * FROM t");

        let mut params = MapParams::new();
        params.insert("a", "x");
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT * FROM t WHERE a = x"
        );
    }

    #[test]
    fn connective_suppressed_after_where() {
        let bundle = bundle(
            "@NAME(Sel)\n  SELECT * FROM t\n  @WHERE\n    @AND(:a)\n      a = :a\n    @AND(:b)\n      b = :b\n",
        );
        let mut params = MapParams::new();
        params.insert("b", "y");
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT * FROM t WHERE b = y"
        );

        params.insert("a", "x");
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT * FROM t WHERE a = x AND b = y"
        );
    }

    #[test]
    fn or_connective() {
        let bundle = bundle(
            "@NAME(Sel)\n  SELECT * FROM t\n  @WHERE\n    @OR(:a)\n      a = :a\n    @OR(:b)\n      b = :b\n",
        );
        let mut params = MapParams::new();
        params.insert("a", "x");
        params.insert("b", "y");
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT * FROM t WHERE a = x OR b = y"
        );
    }

    #[test]
    fn match_value_is_case_insensitive() {
        let bundle = bundle(
            "@NAME(Sel)\n  SELECT 1\n  @IF(:kind = active)\n    AND kind = 1\n",
        );
        let mut params = MapParams::new();
        params.insert("kind", "ACTIVE");
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT 1 AND kind = 1"
        );

        let mut params = MapParams::new();
        params.insert("kind", "inactive");
        assert_eq!(canon(&bundle.get_sql_params("Sel", &params).unwrap()), "SELECT 1");
    }

    #[test]
    fn boolean_predicate_uses_value() {
        let bundle = bundle("@NAME(Sel)\n  SELECT 1\n  @IF(:flag)\n    AND a = 1\n");
        let mut params = MapParams::new();
        params.insert("flag", false);
        assert_eq!(canon(&bundle.get_sql_params("Sel", &params).unwrap()), "SELECT 1");

        params.insert("flag", true);
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT 1 AND a = 1"
        );
    }

    #[test]
    fn loop_expansion_with_join() {
        let bundle = bundle(
            "@NAME(In)\n  IN (\n  @LOOP(:n)\n    :var@LOOPINDEX\n    @LOOPJOIN ,\n  )\n",
        );
        let mut params = MapParams::new();
        params
            .insert("n", 3)
            .insert("var0", "a")
            .insert("var1", "b")
            .insert("var2", "c");
        assert_eq!(
            canon(&bundle.get_sql_params("In", &params).unwrap()),
            "IN ( a , b , c )"
        );
    }

    #[test]
    fn nested_loops_expose_outer_index() {
        let bundle = bundle(
            "@NAME(Matrix)\n  @LOOP(:outer)\n    @LOOP(:inner)\n      cell_@LOOPINDEX2_@LOOPINDEX\n",
        );
        let mut params = MapParams::new();
        params.insert("outer", 2).insert("inner", 2);
        assert_eq!(
            canon(&bundle.get_sql_params("Matrix", &params).unwrap()),
            "cell_0_0 cell_0_1 cell_1_0 cell_1_1"
        );
    }

    #[test]
    fn loop_missing_count_variable() {
        let bundle = bundle("@NAME(In)\n  @LOOP(:n)\n    x\n");
        let err = bundle.get_sql("In").unwrap_err();
        assert!(matches!(err, ElSqlError::MissingVariable { name } if name == "n"));
    }

    #[test]
    fn loop_count_must_be_integer() {
        let bundle = bundle("@NAME(In)\n  @LOOP(:n)\n    x\n");
        let mut params = MapParams::new();
        params.insert("n", "three");
        let err = bundle.get_sql_params("In", &params).unwrap_err();
        assert!(matches!(err, ElSqlError::TypeError { name, .. } if name == "n"));
    }

    #[test]
    fn loop_scoped_predicate_variables() {
        // The predicate prefers the loop-decorated name when present.
        let bundle = bundle(
            "@NAME(Sel)\n  @LOOP(:n)\n    @IF(:flag)\n      row@LOOPINDEX\n",
        );
        let mut params = MapParams::new();
        params
            .insert("n", 2)
            .insert("flag0", true)
            .insert("flag1", false);
        assert_eq!(canon(&bundle.get_sql_params("Sel", &params).unwrap()), "row0");

        // Without decorated names the bare variable decides every
        // iteration.
        let mut params = MapParams::new();
        params.insert("n", 2).insert("flag", true);
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "row0 row1"
        );
    }

    #[test]
    fn value_interpolation() {
        let bundle = bundle("@NAME(Sel)\n  SELECT @VALUE(:col) FROM t\n");
        let mut params = MapParams::new();
        params.insert("col", "age");
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT age FROM t"
        );
    }

    #[test]
    fn value_requires_variable() {
        let bundle = bundle("@NAME(Sel)\n  SELECT @VALUE(:col) FROM t\n");
        let err = bundle.get_sql("Sel").unwrap_err();
        assert!(matches!(err, ElSqlError::MissingVariable { name } if name == "col"));
    }

    #[test]
    fn include_splices_other_fragment() {
        let bundle = bundle(
            "@NAME(Cols)\n  id, name\n@NAME(Sel)\n  SELECT @INCLUDE(Cols) FROM t\n",
        );
        assert_eq!(canon(&bundle.get_sql("Sel").unwrap()), "SELECT id, name FROM t");
    }

    #[test]
    fn include_by_variable() {
        let bundle = bundle(
            "@NAME(Cols)\n  id, name\n@NAME(Sel)\n  SELECT @INCLUDE(:which) FROM t\n",
        );
        let mut params = MapParams::new();
        params.insert("which", "Cols");
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT id, name FROM t"
        );

        let err = bundle.get_sql("Sel").unwrap_err();
        assert!(matches!(err, ElSqlError::MissingVariable { name } if name == "which"));
    }

    #[test]
    fn include_unknown_fragment() {
        let bundle = bundle("@NAME(Sel)\n  SELECT @INCLUDE(Missing) FROM t\n");
        let err = bundle.get_sql("Sel").unwrap_err();
        assert!(matches!(err, ElSqlError::UnknownFragment { name } if name == "Missing"));
    }

    #[test]
    fn cyclic_include_detected() {
        let bundle = bundle(
            "@NAME(A)\n  a @INCLUDE(B)\n@NAME(B)\n  b @INCLUDE(A)\n",
        );
        let err = bundle.get_sql("A").unwrap_err();
        assert!(matches!(err, ElSqlError::CyclicInclude { name } if name == "A"));
    }

    #[test]
    fn self_include_detected() {
        let bundle = bundle("@NAME(A)\n  a @INCLUDE(A)\n");
        let err = bundle.get_sql("A").unwrap_err();
        assert!(matches!(err, ElSqlError::CyclicInclude { name } if name == "A"));
    }

    #[test]
    fn like_goes_through_config() {
        let source = "@NAME(Sel)\n  SELECT 1\n  @WHERE\n    @AND(:name)\n      name @LIKE :name\n";
        let mut params = MapParams::new();
        params.insert("name", "Jo%");

        let bundle = ElSqlBundle::parse(DefaultConfig, &[source]).unwrap();
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT 1 WHERE name LIKE Jo%"
        );

        let bundle = bundle.with_config(HsqlConfig);
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT 1 WHERE name LIKE Jo% ESCAPE '\\'"
        );
    }

    #[test]
    fn offset_fetch_defaults_and_sentinels() {
        let bundle = bundle("@NAME(Sel)\n  SELECT a FROM t @OFFSETFETCH\n");
        // No paging parameters at all: no suffix.
        assert_eq!(canon(&bundle.get_sql("Sel").unwrap()), "SELECT a FROM t");

        let mut params = MapParams::new();
        params.insert("paging_offset", 7).insert("paging_fetch", 3);
        assert_eq!(
            canon(&bundle.get_sql_params("Sel", &params).unwrap()),
            "SELECT a FROM t OFFSET 7 ROWS FETCH NEXT 3 ROWS ONLY"
        );
    }

    #[test]
    fn offset_fetch_type_error() {
        let bundle = bundle("@NAME(Sel)\n  SELECT a FROM t @OFFSETFETCH(:off,:max)\n");
        let mut params = MapParams::new();
        params.insert("off", "seven");
        let err = bundle.get_sql_params("Sel", &params).unwrap_err();
        assert!(matches!(err, ElSqlError::TypeError { name, .. } if name == "off"));
    }

    #[test]
    fn paging_rewrites_by_dialect() {
        let source = "@NAME(Search)\n  @PAGING(:off,:max)\n    SELECT a FROM t ORDER BY a\n";
        let mut params = MapParams::new();
        params.insert("off", 5).insert("max", 10);

        let bundle = ElSqlBundle::parse(PostgresConfig, &[source]).unwrap();
        assert_eq!(
            canon(&bundle.get_sql_params("Search", &params).unwrap()),
            "SELECT a FROM t ORDER BY a LIMIT 10 OFFSET 5"
        );

        let bundle = bundle.with_config(OracleConfig);
        assert_eq!(
            canon(&bundle.get_sql_params("Search", &params).unwrap()),
            "SELECT * FROM ( SELECT row_.*, ROWNUM row_nr FROM ( SELECT a FROM t ORDER BY a ) row_ WHERE ROWNUM <= 15 ) WHERE row_nr > 5"
        );
    }

    #[test]
    fn with_config_shares_fragments() {
        let bundle = bundle("@NAME(Sel)\n  SELECT 1\n");
        let switched = bundle.with_config(PostgresConfig);
        assert_eq!(switched.config().name(), "Postgres");
        assert_eq!(bundle.config().name(), "Default");
        assert_eq!(
            bundle.get_sql("Sel").unwrap(),
            switched.get_sql("Sel").unwrap()
        );
    }

    #[test]
    fn later_resource_overrides_earlier() {
        let a = "@NAME(F)\n  SELECT 1\n";
        let b = "@NAME(F)\n  SELECT 2\n";
        let bundle = ElSqlBundle::parse(DefaultConfig, &[a, b]).unwrap();
        assert_eq!(canon(&bundle.get_sql("F").unwrap()), "SELECT 2");
    }

    #[test]
    fn overlay_keeps_non_overridden_fragments() {
        let a = "@NAME(F)\n  SELECT 1\n@NAME(G)\n  SELECT 9\n";
        let b = "@NAME(F)\n  SELECT 2\n";
        let bundle = ElSqlBundle::parse(DefaultConfig, &[a, b]).unwrap();
        assert_eq!(canon(&bundle.get_sql("F").unwrap()), "SELECT 2");
        assert_eq!(canon(&bundle.get_sql("G").unwrap()), "SELECT 9");
        let names: Vec<_> = bundle.fragment_names().collect();
        assert_eq!(names, vec!["F", "G"]);
    }

    #[test]
    fn parse_error_carries_resource_index() {
        let a = "@NAME(F)\n  SELECT 1\n";
        let b = "@NAME(G)\n  @BOGUS\n";
        let err = ElSqlBundle::parse(DefaultConfig, &[a, b]).unwrap_err();
        let ElSqlError::Parse(parse) = err else {
            panic!("expected parse error");
        };
        assert_eq!(parse.resource, 1);
        assert_eq!(parse.line, 2);
    }

    #[test]
    fn rendered_output_never_doubles_connectives() {
        let bundle = bundle(
            "@NAME(Sel)\n  SELECT * FROM t\n  @WHERE\n    @AND(:a)\n      a = :a\n    @OR(:b)\n      b = :b\n    @AND(:c)\n      c = :c\n",
        );
        let cases: &[&[(&str, &str)]] = &[
            &[],
            &[("a", "1")],
            &[("b", "2")],
            &[("c", "3")],
            &[("a", "1"), ("b", "2")],
            &[("a", "1"), ("c", "3")],
            &[("b", "2"), ("c", "3")],
            &[("a", "1"), ("b", "2"), ("c", "3")],
        ];
        for case in cases {
            let mut params = MapParams::new();
            for (k, v) in *case {
                params.insert(*k, *v);
            }
            let sql = canon(&bundle.get_sql_params("Sel", &params).unwrap());
            for bad in ["WHERE AND", "WHERE OR", "AND AND", "OR OR", "( AND"] {
                assert!(!sql.contains(bad), "{:?} in {:?}", bad, sql);
            }
            assert!(!sql.ends_with("WHERE"), "dangling WHERE in {:?}", sql);
        }
    }

    #[test]
    fn rendering_is_repeatable() {
        let bundle = bundle(
            "@NAME(Sel)\n  SELECT * FROM t\n  @WHERE\n    @AND(:a)\n      a = :a\n",
        );
        let mut params = MapParams::new();
        params.insert("a", "x");
        let first = bundle.get_sql_params("Sel", &params).unwrap();
        let second = bundle.get_sql_params("Sel", &params).unwrap();
        assert_eq!(first, second);
    }
}
