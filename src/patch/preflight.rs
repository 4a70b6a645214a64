//! Syntax preflight for candidate sources
//!
//! Runs before any sandbox call. A candidate that does not parse can never
//! pass verification, and parsing is orders of magnitude cheaper than a
//! container start. The tree-sitter grammar accepts some inputs the
//! interpreter refuses at compile time (Python 2 statements, `return` at
//! module level), so a clean parse is followed by a scope walk.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;
use tree_sitter::{Node, Parser, Tree};

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A failed set_language surfaces as a `None` tree at parse time.
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    Python,
    Unknown,
}

impl SourceLanguage {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("py") => SourceLanguage::Python,
            _ => SourceLanguage::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    /// 1-based.
    pub line: usize,
    /// 1-based.
    pub column: usize,
    pub message: String,
}

impl std::fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}: {}", self.line, self.column, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Valid,
    /// No parser for this language; the candidate is passed through.
    Unchecked,
    SyntaxInvalid(SyntaxIssue),
}

impl ParseResult {
    pub fn is_valid(&self) -> bool {
        !matches!(self, ParseResult::SyntaxInvalid(_))
    }
}

fn parse_python(content: &str) -> Option<Tree> {
    PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None))
}

/// Parse `candidate` and report the first syntax problem, if any.
pub fn preflight(candidate: &str, language: SourceLanguage) -> ParseResult {
    match language {
        SourceLanguage::Unknown => ParseResult::Unchecked,
        SourceLanguage::Python => {
            let Some(tree) = parse_python(candidate) else {
                return ParseResult::SyntaxInvalid(SyntaxIssue {
                    line: 1,
                    column: 1,
                    message: "parser produced no syntax tree".to_string(),
                });
            };
            let root = tree.root_node();
            if !root.has_error() {
                return match compile_issue(root, candidate, Scope::Module, false) {
                    Some(issue) => ParseResult::SyntaxInvalid(issue),
                    None => ParseResult::Valid,
                };
            }
            let issue = first_error_node(root)
                .map(|node| describe_error(node, candidate))
                .unwrap_or_else(|| SyntaxIssue {
                    line: 1,
                    column: 1,
                    message: "syntax error".to_string(),
                });
            ParseResult::SyntaxInvalid(issue)
        }
    }
}

fn first_error_node(root: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node);
        }
        // Only descend into subtrees that contain the error.
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

fn describe_error(node: Node<'_>, content: &str) -> SyntaxIssue {
    let position = node.start_position();
    let message = if node.is_missing() {
        format!("missing `{}`", node.kind())
    } else {
        let snippet = node
            .utf8_text(content.as_bytes())
            .map(|text| text.lines().next().unwrap_or("").trim().to_string())
            .unwrap_or_default();
        if snippet.is_empty() {
            "unexpected token".to_string()
        } else {
            format!("unexpected `{}`", crate::util::truncate(&snippet, 40))
        }
    };
    SyntaxIssue {
        line: position.row + 1,
        column: position.column + 1,
        message,
    }
}

/// Innermost enclosing code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Module,
    Class,
    Function,
    Lambda,
}

/// First construct in a cleanly parsed tree that CPython rejects while
/// compiling. `in_function` is true anywhere below a `def`, class bodies
/// included.
fn compile_issue(
    node: Node<'_>,
    content: &str,
    scope: Scope,
    in_function: bool,
) -> Option<SyntaxIssue> {
    let message = match node.kind() {
        "print_statement" if !keyword_call(node, content) => {
            Some("Missing parentheses in call to 'print'")
        }
        "exec_statement" if !keyword_call(node, content) => {
            Some("Missing parentheses in call to 'exec'")
        }
        "return_statement" if scope != Scope::Function => Some("'return' outside function"),
        "yield" if !matches!(scope, Scope::Function | Scope::Lambda) => {
            Some("'yield' outside function")
        }
        "nonlocal_statement" if !in_function => {
            Some("nonlocal declaration not allowed at module level")
        }
        _ => None,
    };
    if let Some(message) = message {
        let position = node.start_position();
        return Some(SyntaxIssue {
            line: position.row + 1,
            column: position.column + 1,
            message: message.to_string(),
        });
    }

    let (inner, inner_in_function) = match node.kind() {
        "function_definition" => (Scope::Function, true),
        "class_definition" => (Scope::Class, in_function),
        "lambda" => (Scope::Lambda, in_function),
        _ => (scope, in_function),
    };
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
    children
        .into_iter()
        .find_map(|child| compile_issue(child, content, inner, inner_in_function))
}

/// `print (x)` is still a valid Python 3 call even when the grammar files
/// it under the statement form.
fn keyword_call(node: Node<'_>, content: &str) -> bool {
    let Some(keyword) = node.child(0) else {
        return false;
    };
    content
        .get(keyword.end_byte()..node.end_byte())
        .map(|rest| rest.trim_start().starts_with('('))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SymbolKind {
    Function,
    AsyncFunction,
    Class,
}

/// Top-level `def` / `async def` / `class` names. `None` when the source does
/// not parse cleanly.
pub fn top_level_symbols(content: &str) -> Option<BTreeSet<(SymbolKind, String)>> {
    let tree = parse_python(content)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let mut symbols = BTreeSet::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        let definition = if child.kind() == "decorated_definition" {
            match child.child_by_field_name("definition") {
                Some(def) => def,
                None => continue,
            }
        } else {
            child
        };

        let kind = match definition.kind() {
            "function_definition" => {
                let is_async = definition
                    .child(0)
                    .map(|first| first.kind() == "async")
                    .unwrap_or(false);
                if is_async {
                    SymbolKind::AsyncFunction
                } else {
                    SymbolKind::Function
                }
            }
            "class_definition" => SymbolKind::Class,
            _ => continue,
        };

        if let Some(name) = definition
            .child_by_field_name("name")
            .and_then(|n| n.utf8_text(content.as_bytes()).ok())
        {
            symbols.insert((kind, name.to_string()));
        }
    }
    Some(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_valid_python_passes() {
        let source = "def divide(a, b):\n    if b == 0:\n        return None\n    return a / b\n\nprint(divide(4, 2))\n";
        assert_eq!(preflight(source, SourceLanguage::Python), ParseResult::Valid);
    }

    #[test]
    fn test_empty_source_parses() {
        assert_eq!(preflight("", SourceLanguage::Python), ParseResult::Valid);
    }

    #[test]
    fn test_unterminated_block_is_rejected() {
        let source = "def broken(:\n    return 1\n";
        let result = preflight(source, SourceLanguage::Python);
        assert!(matches!(result, ParseResult::SyntaxInvalid(_)));
        assert!(!result.is_valid());
    }

    #[test]
    fn test_unbalanced_parenthesis_is_rejected() {
        let source = "print((1, 2)\nx = 3\n";
        assert!(matches!(
            preflight(source, SourceLanguage::Python),
            ParseResult::SyntaxInvalid(_)
        ));
    }

    #[test]
    fn test_prose_is_rejected() {
        let source = "Here is the fixed code: it now checks for zero.\n";
        assert!(!preflight(source, SourceLanguage::Python).is_valid());
    }

    #[test]
    fn test_issue_reports_position() {
        let source = "x = 1\ny = (2,\n";
        match preflight(source, SourceLanguage::Python) {
            ParseResult::SyntaxInvalid(issue) => {
                assert!(issue.line >= 2, "issue: {}", issue);
                assert!(issue.column >= 1);
            }
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_language_is_unchecked() {
        assert_eq!(
            preflight("{{{ not python", SourceLanguage::Unknown),
            ParseResult::Unchecked
        );
        assert_eq!(
            SourceLanguage::from_path(&PathBuf::from("main.go")),
            SourceLanguage::Unknown
        );
        assert_eq!(
            SourceLanguage::from_path(&PathBuf::from("pkg/app.PY")),
            SourceLanguage::Python
        );
    }

    fn rejection(source: &str) -> SyntaxIssue {
        match preflight(source, SourceLanguage::Python) {
            ParseResult::SyntaxInvalid(issue) => issue,
            other => panic!("expected rejection of {:?}, got {:?}", source, other),
        }
    }

    #[test]
    fn test_python2_print_is_rejected() {
        let issue = rejection("def divide(a, b):\n    return a / b\n\nprint 'result', divide(4, 2)\n");
        assert_eq!(issue.line, 4);
        assert!(issue.message.contains("print"), "issue: {}", issue);
    }

    #[test]
    fn test_python2_exec_is_rejected() {
        let issue = rejection("exec 'x = 1'\n");
        assert!(issue.message.contains("exec"), "issue: {}", issue);
    }

    #[test]
    fn test_print_call_with_space_is_valid() {
        assert_eq!(
            preflight("print (1)\nprint(\"a\", \"b\")\n", SourceLanguage::Python),
            ParseResult::Valid
        );
    }

    #[test]
    fn test_module_level_return_is_rejected() {
        let issue = rejection("x = 1\nreturn x\n");
        assert_eq!(issue.line, 2);
        assert_eq!(issue.message, "'return' outside function");
    }

    #[test]
    fn test_return_in_class_body_is_rejected() {
        let issue = rejection("def outer():\n    class Inner:\n        return 1\n    return Inner\n");
        assert_eq!(issue.line, 3);
        assert_eq!(issue.message, "'return' outside function");
    }

    #[test]
    fn test_module_level_yield_is_rejected() {
        let issue = rejection("values = [1, 2]\nyield values\n");
        assert_eq!(issue.message, "'yield' outside function");
    }

    #[test]
    fn test_module_level_nonlocal_is_rejected() {
        let issue = rejection("count = 0\nnonlocal count\n");
        assert_eq!(issue.message, "nonlocal declaration not allowed at module level");
    }

    #[test]
    fn test_scoped_statements_inside_functions_are_valid() {
        let source = "def counter():\n    count = 0\n    def bump():\n        nonlocal count\n        count += 1\n        return count\n    return bump\n\ndef numbers():\n    yield 1\n    yield from range(3)\n\nclass Box:\n    def get(self):\n        return 1\n\nsquare = lambda x: x * x\n";
        assert_eq!(preflight(source, SourceLanguage::Python), ParseResult::Valid);
    }

    #[test]
    fn test_top_level_symbols() {
        let source = "import os\n\nclass Store:\n    def get(self):\n        return 1\n\n@cache\ndef load():\n    pass\n\nasync def fetch():\n    pass\n";
        let symbols = top_level_symbols(source).unwrap();
        assert!(symbols.contains(&(SymbolKind::Class, "Store".to_string())));
        assert!(symbols.contains(&(SymbolKind::Function, "load".to_string())));
        assert!(symbols.contains(&(SymbolKind::AsyncFunction, "fetch".to_string())));
        // Methods are not top-level.
        assert!(!symbols.iter().any(|(_, name)| name == "get"));
    }

    #[test]
    fn test_top_level_symbols_none_on_error() {
        assert!(top_level_symbols("def (:\n").is_none());
    }
}
