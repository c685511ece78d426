use indexmap::IndexMap;

use crate::config::ElSqlConfig;
use crate::error::ParseError;
use crate::fragment::{Fragment, IncludeTarget};

type ParseResult<T> = Result<T, ParseError>;

/// One source line, with its indentation already measured.
///
/// Indent is the count of leading whitespace characters; a tab counts as
/// one column.
#[derive(Debug, Clone, Copy)]
struct Line<'a> {
    /// 1-indexed line number within the resource
    number: usize,
    indent: usize,
    /// The line with leading/trailing whitespace removed.
    text: &'a str,
}

/// Parses a single resource into its named fragment roots.
///
/// Layering of multiple resources (later definitions win) happens in the
/// bundle, which calls this once per resource.
pub(crate) fn parse_resource(
    config: &dyn ElSqlConfig,
    resource: usize,
    text: &str,
) -> ParseResult<IndexMap<String, Fragment>> {
    ElSqlParser::new(config, resource, text).parse()
}

struct ElSqlParser<'a> {
    config: &'a dyn ElSqlConfig,
    resource: usize,
    lines: Vec<Line<'a>>,
    pos: usize,
}

impl<'a> ElSqlParser<'a> {
    fn new(config: &'a dyn ElSqlConfig, resource: usize, text: &'a str) -> Self {
        // Blank lines and -- comment lines play no part in nesting, so they
        // are dropped up front. Original numbering is kept for errors.
        let lines = text
            .lines()
            .enumerate()
            .filter_map(|(idx, raw)| {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.starts_with("--") {
                    return None;
                }
                let indent = raw.chars().take_while(|c| *c == ' ' || *c == '\t').count();
                Some(Line {
                    number: idx + 1,
                    indent,
                    text: trimmed,
                })
            })
            .collect();
        ElSqlParser {
            config,
            resource,
            lines,
            pos: 0,
        }
    }

    #[inline]
    fn make_error(&self, line: &Line<'_>, message: impl Into<String>) -> ParseError {
        ParseError::new(self.resource, line.number, message)
    }

    fn peek(&self) -> Option<Line<'a>> {
        self.lines.get(self.pos).copied()
    }

    fn parse(mut self) -> ParseResult<IndexMap<String, Fragment>> {
        let mut map = IndexMap::new();
        while let Some(line) = self.peek() {
            if !line.text.starts_with("@NAME") {
                return Err(self.make_error(&line, "only @NAME blocks may appear at the top level"));
            }
            self.pos += 1;
            let (name, fragment) = self.parse_name(line)?;
            map.insert(name, fragment);
        }
        Ok(map)
    }

    /// Parses one `@NAME(..)` block. The block is closed only by the next
    /// `@NAME` or the end of the resource, whatever its indentation.
    fn parse_name(&mut self, line: Line<'a>) -> ParseResult<(String, Fragment)> {
        let (arg, rest) = self.paren_arg(&line, "@NAME")?;
        if !rest.is_empty() {
            return Err(self.make_error(&line, "unexpected text after @NAME(..)"));
        }
        if arg.is_empty() || !arg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(self.make_error(&line, format!("invalid fragment name: '{}'", arg)));
        }
        let mut fragment = Fragment::Name {
            name: arg.to_string(),
            fragments: Vec::new(),
        };
        while let Some(next) = self.peek() {
            if next.text.starts_with("@NAME") {
                break;
            }
            self.pos += 1;
            self.parse_block_line(&mut fragment, next)?;
        }
        if fragment.children().is_empty() {
            return Err(self.make_error(&line, format!("@NAME({}) requires an indented body", arg)));
        }
        Ok((arg.to_string(), fragment))
    }

    /// Consumes the body of an open container: the following lines of
    /// strictly greater indent.
    fn parse_container(&mut self, container: &mut Fragment, indent: usize) -> ParseResult<()> {
        while let Some(line) = self.peek() {
            if line.indent <= indent {
                break;
            }
            self.pos += 1;
            self.parse_block_line(container, line)?;
        }
        Ok(())
    }

    /// Classifies one line inside a block and appends the result to the
    /// container.
    fn parse_block_line(&mut self, container: &mut Fragment, line: Line<'a>) -> ParseResult<()> {
        let directive = match line.text.strip_prefix('@') {
            Some(rest) => rest
                .split(|c: char| !c.is_ascii_alphanumeric())
                .next()
                .unwrap_or(""),
            None => {
                let text = self.config.format_line(line.text);
                return self.parse_text(container, &text, &line, false);
            }
        };
        match directive {
            "NAME" => Err(self.make_error(&line, "@NAME cannot be nested inside another block")),
            "WHERE" => {
                self.expect_bare(&line, "@WHERE")?;
                let fragment = Fragment::Where {
                    fragments: Vec::new(),
                };
                self.parse_block_body(container, fragment, &line, "@WHERE")
            }
            "AND" | "OR" | "IF" => {
                let tag = &line.text[..directive.len() + 1];
                let (arg, rest) = self.paren_arg(&line, tag)?;
                if !rest.is_empty() {
                    return Err(self.make_error(&line, format!("unexpected text after {}(..)", tag)));
                }
                let (variable, match_value) = self.conditional_arg(&line, arg)?;
                let fragments = Vec::new();
                let fragment = match directive {
                    "AND" => Fragment::And {
                        variable,
                        match_value,
                        fragments,
                    },
                    "OR" => Fragment::Or {
                        variable,
                        match_value,
                        fragments,
                    },
                    _ => Fragment::If {
                        variable,
                        match_value,
                        fragments,
                    },
                };
                self.parse_block_body(container, fragment, &line, tag)
            }
            "LOOP" => {
                let (arg, rest) = self.paren_arg(&line, "@LOOP")?;
                if !rest.is_empty() {
                    return Err(self.make_error(&line, "unexpected text after @LOOP(..)"));
                }
                let variable = self.variable_name(&line, arg.trim())?;
                let fragment = Fragment::Loop {
                    variable,
                    fragments: Vec::new(),
                };
                self.parse_block_body(container, fragment, &line, "@LOOP")
            }
            "LOOPJOIN" => {
                let join = line.text["@LOOPJOIN".len()..].trim();
                let text = if join.is_empty() {
                    String::new()
                } else {
                    format!("{} ", join)
                };
                container.push_child(Fragment::LoopJoin { text });
                Ok(())
            }
            "PAGING" => {
                let (arg, rest) = self.paren_arg(&line, "@PAGING")?;
                if !rest.is_empty() {
                    return Err(self.make_error(&line, "unexpected text after @PAGING(..)"));
                }
                let (offset_variable, fetch_variable) = self.offset_fetch_args(&line, arg)?;
                let fragment = Fragment::Paging {
                    offset_variable,
                    fetch_variable,
                    fragments: Vec::new(),
                };
                self.parse_block_body(container, fragment, &line, "@PAGING")
            }
            // The remaining directives are valid mid-line and fall through
            // to the text scanner even when they open the line.
            "VALUE" | "INCLUDE" | "LIKE" | "ENDLIKE" | "OFFSETFETCH" => {
                let text = self.config.format_line(line.text);
                self.parse_text(container, &text, &line, false)
            }
            other => Err(self.make_error(&line, format!("unknown directive: @{}", other))),
        }
    }

    /// Recurses into a block directive's body and appends the finished
    /// fragment. An empty body is an error.
    fn parse_block_body(
        &mut self,
        container: &mut Fragment,
        mut fragment: Fragment,
        line: &Line<'a>,
        tag: &str,
    ) -> ParseResult<()> {
        self.parse_container(&mut fragment, line.indent)?;
        if fragment.children().is_empty() {
            return Err(self.make_error(line, format!("{} requires an indented body", tag)));
        }
        container.push_child(fragment);
        Ok(())
    }

    /// Scans a SQL text line for mid-line directives (`@VALUE`, `@INCLUDE`,
    /// `@LIKE .. @ENDLIKE`, `@OFFSETFETCH`), splitting it into fragments.
    fn parse_text(
        &self,
        container: &mut Fragment,
        text: &str,
        line: &Line<'a>,
        in_like: bool,
    ) -> ParseResult<()> {
        let mut rest = text;
        while !rest.is_empty() {
            let Some((at, token)) = find_inline_token(rest) else {
                push_text(container, rest);
                break;
            };
            push_text(container, &rest[..at]);
            let after = &rest[at + token.len()..];
            match token {
                "@VALUE" => {
                    let (arg, remainder) = self.inline_paren_arg(line, after, "@VALUE")?;
                    let variable = self.variable_name(line, arg.trim())?;
                    container.push_child(Fragment::Value { variable });
                    rest = remainder;
                }
                "@INCLUDE" => {
                    let (arg, remainder) = self.inline_paren_arg(line, after, "@INCLUDE")?;
                    let arg = arg.trim();
                    let target = if arg.starts_with(':') {
                        IncludeTarget::Variable(self.variable_name(line, arg)?)
                    } else if !arg.is_empty()
                        && arg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        IncludeTarget::Literal(arg.to_string())
                    } else {
                        return Err(
                            self.make_error(line, format!("invalid @INCLUDE target: '{}'", arg))
                        );
                    };
                    container.push_child(Fragment::Include { target });
                    rest = remainder;
                }
                "@OFFSETFETCH" => {
                    let (offset_variable, fetch_variable, remainder) = if after.starts_with('(') {
                        let (arg, remainder) = self.inline_paren_arg(line, after, "@OFFSETFETCH")?;
                        let (off, fetch) = self.offset_fetch_args(line, arg)?;
                        (off, fetch, remainder)
                    } else {
                        // Bare form reads the conventional parameter names.
                        (
                            "paging_offset".to_string(),
                            "paging_fetch".to_string(),
                            after,
                        )
                    };
                    container.push_child(Fragment::OffsetFetch {
                        offset_variable,
                        fetch_variable,
                    });
                    rest = remainder;
                }
                "@LIKE" => {
                    let (body, remainder) = match find_token(after, "@ENDLIKE") {
                        Some(end) => (&after[..end], &after[end + "@ENDLIKE".len()..]),
                        None => (after, ""),
                    };
                    let mut like = Fragment::Like {
                        fragments: Vec::new(),
                    };
                    self.parse_text(&mut like, body, line, true)?;
                    if like.children().is_empty() {
                        return Err(self.make_error(line, "@LIKE requires content"));
                    }
                    container.push_child(like);
                    rest = remainder;
                }
                "@ENDLIKE" => {
                    // A closing token inside an open region was consumed by
                    // the @LIKE arm above, so this one has no opener.
                    debug_assert!(!in_like);
                    return Err(self.make_error(line, "@ENDLIKE without a preceding @LIKE"));
                }
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    /// Rejects trailing content on a directive that takes no arguments.
    fn expect_bare(&self, line: &Line<'a>, tag: &str) -> ParseResult<()> {
        if line.text.len() > tag.len() {
            return Err(self.make_error(line, format!("unexpected text after {}", tag)));
        }
        Ok(())
    }

    /// Extracts `(..)` following `tag` at the start of the line, returning
    /// the inside and whatever trails the closing paren.
    fn paren_arg(&self, line: &Line<'a>, tag: &str) -> ParseResult<(&'a str, &'a str)> {
        let after = &line.text[tag.len()..];
        match self.split_parens(after) {
            Some((inside, rest)) => Ok((inside, rest.trim())),
            None => Err(self.make_error(
                line,
                format!("{} requires a parenthesised argument", tag),
            )),
        }
    }

    fn inline_paren_arg<'s>(
        &self,
        line: &Line<'a>,
        after: &'s str,
        tag: &str,
    ) -> ParseResult<(&'s str, &'s str)> {
        match self.split_parens(after) {
            Some((inside, rest)) => Ok((inside, rest)),
            None => Err(self.make_error(
                line,
                format!("{} requires a parenthesised argument", tag),
            )),
        }
    }

    fn split_parens<'s>(&self, text: &'s str) -> Option<(&'s str, &'s str)> {
        let after = text.strip_prefix('(')?;
        let close = after.find(')')?;
        Some((&after[..close], &after[close + 1..]))
    }

    /// Validates a `:var` token and strips the colon.
    fn variable_name(&self, line: &Line<'a>, token: &str) -> ParseResult<String> {
        let name = token.strip_prefix(':').ok_or_else(|| {
            self.make_error(
                line,
                format!("argument is not a variable (missing colon): '{}'", token),
            )
        })?;
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if !valid {
            return Err(self.make_error(line, format!("invalid variable name: ':{}'", name)));
        }
        Ok(name.to_string())
    }

    /// Parses `:var` or `:var = literal` for the conditional directives.
    fn conditional_arg(
        &self,
        line: &Line<'a>,
        arg: &str,
    ) -> ParseResult<(String, Option<String>)> {
        match arg.split_once('=') {
            Some((var, literal)) => {
                let variable = self.variable_name(line, var.trim())?;
                let literal = literal.trim();
                if literal.is_empty()
                    || !literal.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(
                        self.make_error(line, format!("invalid match value: '{}'", literal))
                    );
                }
                Ok((variable, Some(literal.to_string())))
            }
            None => Ok((self.variable_name(line, arg.trim())?, None)),
        }
    }

    /// Parses the `:offset,:fetch` variable pair.
    fn offset_fetch_args(&self, line: &Line<'a>, arg: &str) -> ParseResult<(String, String)> {
        let (off, fetch) = arg.split_once(',').ok_or_else(|| {
            self.make_error(line, "expected two variables separated by a comma")
        })?;
        Ok((
            self.variable_name(line, off.trim())?,
            self.variable_name(line, fetch.trim())?,
        ))
    }
}

fn push_text(container: &mut Fragment, segment: &str) {
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return;
    }
    container.push_child(Fragment::Text {
        text: format!("{} ", trimmed),
    });
}

/// Finds the earliest mid-line directive token, respecting token
/// boundaries.
fn find_inline_token(text: &str) -> Option<(usize, &'static str)> {
    let mut best: Option<(usize, &'static str)> = None;
    for token in ["@VALUE", "@INCLUDE", "@OFFSETFETCH", "@ENDLIKE", "@LIKE"] {
        if let Some(at) = find_token(text, token) {
            if best.map_or(true, |(b, _)| at < b) {
                best = Some((at, token));
            }
        }
    }
    best
}

/// Finds `token` in `text`, requiring that the next character does not
/// extend the directive word (so `@LIKE` never matches inside a longer
/// token). `@VALUE` and `@INCLUDE` must be followed by their argument
/// list.
fn find_token(text: &str, token: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(i) = text[from..].find(token) {
        let at = from + i;
        let after = &text[at + token.len()..];
        let boundary = match token {
            "@VALUE" | "@INCLUDE" => after.starts_with('('),
            _ => !after
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_'),
        };
        if boundary {
            return Some(at);
        }
        from = at + token.len();
    }
    None
}
