//! Walks a fragment tree against a parameter source, producing SQL text.
//!
//! The walker is a single dispatch over [`Fragment`] with per-variant
//! logic. The interesting parts are the non-local textual rules: `@WHERE`
//! elides itself when its body renders empty, and `@AND`/`@OR` suppress
//! their connective when the output so far already ends in an open clause.

use crate::bundle::ElSqlBundle;
use crate::config::FETCH_UNLIMITED;
use crate::error::{ElSqlError, ElSqlResult};
use crate::fragment::{Fragment, IncludeTarget};
use crate::params::{SqlParams, SqlValue};

pub(crate) struct SqlRenderer<'a> {
    bundle: &'a ElSqlBundle,
    params: &'a dyn SqlParams,
    /// Indices of the enclosing `@LOOP`s, innermost last. Empty outside
    /// any loop.
    loop_indices: Vec<i64>,
    /// Names currently being rendered, used to refuse cyclic `@INCLUDE`
    /// chains.
    active_includes: Vec<String>,
}

impl<'a> SqlRenderer<'a> {
    pub(crate) fn new(bundle: &'a ElSqlBundle, params: &'a dyn SqlParams) -> Self {
        SqlRenderer {
            bundle,
            params,
            loop_indices: Vec::new(),
            active_includes: Vec::new(),
        }
    }

    /// Renders the body of a named block into `buf`.
    pub(crate) fn render_named(&mut self, name: &str, buf: &mut String) -> ElSqlResult<()> {
        let fragment = self.bundle.fragment(name)?;
        self.active_includes.push(name.to_string());
        let result = self.render_children(fragment.children(), buf);
        self.active_includes.pop();
        result
    }

    fn render_children(&mut self, children: &[Fragment], buf: &mut String) -> ElSqlResult<()> {
        for child in children {
            self.render(child, buf)?;
        }
        Ok(())
    }

    fn render(&mut self, fragment: &Fragment, buf: &mut String) -> ElSqlResult<()> {
        match fragment {
            Fragment::Text { text } => {
                let text = self.apply_loop_tokens(text);
                self.append_substituted(&text, buf);
                Ok(())
            }
            Fragment::Container { fragments } | Fragment::Name { fragments, .. } => {
                self.render_children(fragments, buf)
            }
            Fragment::Where { fragments } => {
                let start = buf.len();
                buf.push_str("WHERE ");
                let body_start = buf.len();
                self.render_children(fragments, buf)?;
                if buf[body_start..].trim().is_empty() {
                    buf.truncate(start);
                }
                Ok(())
            }
            Fragment::And {
                variable,
                match_value,
                fragments,
            } => self.render_conjunction(variable, match_value.as_deref(), fragments, "AND ", buf),
            Fragment::Or {
                variable,
                match_value,
                fragments,
            } => self.render_conjunction(variable, match_value.as_deref(), fragments, "OR ", buf),
            Fragment::If {
                variable,
                match_value,
                fragments,
            } => {
                if self.is_match(variable, match_value.as_deref()) {
                    self.render_children(fragments, buf)?;
                }
                Ok(())
            }
            Fragment::Loop {
                variable,
                fragments,
            } => self.render_loop(variable, fragments, buf),
            // Emitted positionally by the enclosing loop; inert on its own.
            Fragment::LoopJoin { .. } => Ok(()),
            Fragment::Include { target } => self.render_include(target, buf),
            Fragment::Value { variable } => {
                let name = self.loop_scoped(variable);
                let value = self
                    .params
                    .get_value(&name)
                    .ok_or(ElSqlError::MissingVariable { name })?;
                buf.push_str(&value.to_string());
                buf.push(' ');
                Ok(())
            }
            Fragment::Like { fragments } => {
                let mut scratch = String::new();
                self.render_children(fragments, &mut scratch)?;
                buf.push_str(&self.bundle.config().format_like(&scratch));
                Ok(())
            }
            Fragment::OffsetFetch {
                offset_variable,
                fetch_variable,
            } => {
                let offset = self.int_param(offset_variable, 0)?;
                let fetch = self.int_param(fetch_variable, FETCH_UNLIMITED)?;
                buf.push_str(&self.bundle.config().offset_fetch(offset, fetch));
                Ok(())
            }
            Fragment::Paging {
                offset_variable,
                fetch_variable,
                fragments,
            } => {
                let offset = self.int_param(offset_variable, 0)?;
                let fetch = self.int_param(fetch_variable, FETCH_UNLIMITED)?;
                let mut scratch = String::new();
                self.render_children(fragments, &mut scratch)?;
                buf.push_str(&self.bundle.config().paging(offset, fetch, &scratch));
                Ok(())
            }
        }
    }

    fn render_conjunction(
        &mut self,
        variable: &str,
        match_value: Option<&str>,
        fragments: &[Fragment],
        connective: &str,
        buf: &mut String,
    ) -> ElSqlResult<()> {
        if !self.is_match(variable, match_value) {
            return Ok(());
        }
        let mut scratch = String::new();
        self.render_children(fragments, &mut scratch)?;
        if scratch.trim().is_empty() {
            return Ok(());
        }
        if !ends_with_open_clause(buf) {
            buf.push_str(connective);
        }
        buf.push_str(&scratch);
        Ok(())
    }

    fn render_loop(
        &mut self,
        variable: &str,
        fragments: &[Fragment],
        buf: &mut String,
    ) -> ElSqlResult<()> {
        let value = self
            .params
            .get_value(variable)
            .ok_or_else(|| ElSqlError::MissingVariable {
                name: variable.to_string(),
            })?;
        let count = value.as_int().ok_or_else(|| ElSqlError::TypeError {
            name: variable.to_string(),
            expected: "an integer",
        })?;
        for i in 0..count {
            self.loop_indices.push(i);
            if i > 0 {
                for child in fragments {
                    if let Fragment::LoopJoin { text } = child {
                        buf.push_str(text);
                    }
                }
            }
            for child in fragments {
                if !matches!(child, Fragment::LoopJoin { .. }) {
                    self.render(child, buf)?;
                }
            }
            self.loop_indices.pop();
        }
        Ok(())
    }

    fn render_include(&mut self, target: &IncludeTarget, buf: &mut String) -> ElSqlResult<()> {
        let name = match target {
            IncludeTarget::Literal(name) => name.clone(),
            IncludeTarget::Variable(variable) => {
                let scoped = self.loop_scoped(variable);
                self.params
                    .get_value(&scoped)
                    .ok_or(ElSqlError::MissingVariable { name: scoped })?
                    .to_string()
            }
        };
        if self.active_includes.iter().any(|active| *active == name) {
            return Err(ElSqlError::CyclicInclude { name });
        }
        let fragment = self.bundle.fragment(&name)?;
        self.active_includes.push(name);
        let result = self.render_children(fragment.children(), buf);
        self.active_includes.pop();
        result
    }

    /// Predicate for `@IF`/`@AND`/`@OR`.
    ///
    /// The effective variable prefers the loop-decorated name when one is
    /// present. An absent variable is false; a match literal compares
    /// case-insensitively against the value's string form; a bare boolean
    /// is itself; any other present value is true.
    fn is_match(&self, variable: &str, match_value: Option<&str>) -> bool {
        let name = self.loop_scoped(variable);
        let Some(value) = self.params.get_value(&name) else {
            return false;
        };
        if let Some(literal) = match_value {
            return literal.eq_ignore_ascii_case(&value.to_string());
        }
        match value {
            SqlValue::Bool(b) => *b,
            _ => true,
        }
    }

    /// Inside a loop, prefers `name<index>` when the parameter source has
    /// it; otherwise the bare name.
    fn loop_scoped(&self, name: &str) -> String {
        if let Some(index) = self.loop_indices.last() {
            let decorated = format!("{}{}", name, index);
            if self.params.has_value(&decorated) {
                return decorated;
            }
        }
        name.to_string()
    }

    fn int_param(&self, variable: &str, default: i64) -> ElSqlResult<i64> {
        let name = self.loop_scoped(variable);
        match self.params.get_value(&name) {
            None => Ok(default),
            Some(value) => value.as_int().ok_or(ElSqlError::TypeError {
                name,
                expected: "an integer",
            }),
        }
    }

    /// Replaces `@LOOPINDEX` tokens with the enclosing loop indices,
    /// longest token first so `@LOOPINDEX2` is never clipped by
    /// `@LOOPINDEX`. Tokens deeper than the current nesting stay verbatim.
    fn apply_loop_tokens(&self, text: &str) -> String {
        if !text.contains("@LOOPINDEX") {
            return text.to_string();
        }
        let depth = self.loop_indices.len();
        let mut out = text.to_string();
        for (token, outer) in [("@LOOPINDEX3", 2), ("@LOOPINDEX2", 1), ("@LOOPINDEX", 0)] {
            if depth > outer {
                let index = self.loop_indices[depth - 1 - outer];
                out = out.replace(token, &index.to_string());
            }
        }
        out
    }

    /// Appends `text`, replacing each `:ident` token the parameter source
    /// knows with the value's string form. Unknown names stay verbatim so
    /// deliberate bind parameters survive rendering.
    fn append_substituted(&self, text: &str, buf: &mut String) {
        let mut rest = text;
        while let Some(pos) = rest.find(':') {
            buf.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let end = after
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(after.len());
            let name = &after[..end];
            let is_identifier = name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            match self.params.get_value(name) {
                Some(value) if is_identifier => buf.push_str(&value.to_string()),
                _ => {
                    buf.push(':');
                    buf.push_str(name);
                }
            }
            rest = &after[end..];
        }
        buf.push_str(rest);
    }
}

/// Whether the output so far (ignoring trailing whitespace) is empty or
/// ends with the word `WHERE`, `AND`, `OR`, or an opening paren - the
/// positions where a connective would be redundant.
fn ends_with_open_clause(buf: &str) -> bool {
    let tail = buf.trim_end();
    if tail.is_empty() || tail.ends_with('(') {
        return true;
    }
    for word in ["WHERE", "AND", "OR"] {
        if tail.ends_with(word) {
            let before = tail[..tail.len() - word.len()].chars().next_back();
            if before.map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_') {
                return true;
            }
        }
    }
    false
}
