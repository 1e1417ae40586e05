//! Tree-sitter-based Python parser with deep name analysis.
//!
//! Syntax validation walks the parse tree looking for ERROR and missing
//! nodes. Name analysis runs two passes: collect every defined name
//! (functions, classes, parameters, assignment targets, imports), then flag
//! identifiers referenced in load context that are neither defined,
//! built-in, nor imported. Import targets are resolved against an embedded
//! standard-library module list plus workspace-known modules.

use super::{CodeParser, NameFinding, SemanticFindings, SyntaxCheck};
use std::collections::HashSet;
use tree_sitter::{Node, Parser};

/// Python built-in names. Names in this set are never "undefined".
const PYTHON_BUILTINS: &[&str] = &[
    "abs", "aiter", "anext", "all", "any", "ascii", "bin", "bool", "breakpoint", "bytearray",
    "bytes", "callable", "chr", "classmethod", "compile", "complex", "delattr", "dict", "dir",
    "divmod", "enumerate", "eval", "exec", "filter", "float", "format", "frozenset", "getattr",
    "globals", "hasattr", "hash", "help", "hex", "id", "input", "int", "isinstance", "issubclass",
    "iter", "len", "list", "locals", "map", "max", "memoryview", "min", "next", "object", "oct",
    "open", "ord", "pow", "print", "property", "range", "repr", "reversed", "round", "set",
    "setattr", "slice", "sorted", "staticmethod", "str", "sum", "super", "tuple", "type", "vars",
    "zip", "__import__", "__name__", "__file__", "__doc__", "__debug__", "NotImplemented",
    "Ellipsis", "BaseException", "Exception", "ArithmeticError", "AssertionError",
    "AttributeError", "EOFError", "FileExistsError", "FileNotFoundError", "ImportError",
    "IndentationError", "IndexError", "InterruptedError", "IsADirectoryError", "KeyError",
    "KeyboardInterrupt", "LookupError", "MemoryError", "ModuleNotFoundError", "NameError",
    "NotADirectoryError", "NotImplementedError", "OSError", "IOError", "OverflowError",
    "PermissionError", "RecursionError", "ReferenceError", "RuntimeError", "StopAsyncIteration",
    "StopIteration", "SyntaxError", "SystemError", "SystemExit", "TimeoutError", "TypeError",
    "UnboundLocalError", "UnicodeDecodeError", "UnicodeEncodeError", "UnicodeError",
    "ValueError", "ZeroDivisionError", "Warning", "DeprecationWarning", "FutureWarning",
    "RuntimeWarning", "UserWarning",
];

/// Top-level standard-library modules considered always resolvable.
const PYTHON_STDLIB_MODULES: &[&str] = &[
    "abc", "argparse", "array", "asyncio", "base64", "binascii", "bisect", "bz2", "calendar",
    "codecs", "collections", "concurrent", "configparser", "contextlib", "copy", "csv", "ctypes",
    "dataclasses", "datetime", "decimal", "difflib", "dis", "email", "enum", "errno", "fnmatch",
    "fractions", "functools", "gc", "getpass", "gettext", "glob", "graphlib", "gzip", "hashlib",
    "heapq", "hmac", "html", "http", "importlib", "inspect", "io", "ipaddress", "itertools",
    "json", "keyword", "locale", "logging", "lzma", "math", "mimetypes", "multiprocessing",
    "numbers", "operator", "os", "pathlib", "pickle", "pkgutil", "platform", "pprint", "pstats",
    "pty", "queue", "random", "re", "reprlib", "sched", "secrets", "select", "selectors",
    "shlex", "shutil", "signal", "site", "socket", "socketserver", "sqlite3", "ssl", "stat",
    "statistics", "string", "struct", "subprocess", "sys", "sysconfig", "tarfile", "tempfile",
    "textwrap", "threading", "time", "timeit", "token", "tokenize", "traceback", "types",
    "typing", "unicodedata", "unittest", "urllib", "uuid", "venv", "warnings", "weakref",
    "xml", "zipfile", "zlib", "zoneinfo",
];

/// Tree-sitter-backed Python parser.
pub struct PythonParser;

impl PythonParser {
    pub fn new() -> Self {
        Self
    }

    fn parse(&self, code: &str) -> Option<tree_sitter::Tree> {
        let mut parser = Parser::new();
        parser
            .set_language(tree_sitter_python::language())
            .expect("python grammar version mismatch");
        parser.parse(code, None)
    }
}

impl Default for PythonParser {
    fn default() -> Self {
        Self::new()
    }
}

fn node_text<'a>(node: Node<'_>, code: &'a str) -> &'a str {
    node.utf8_text(code.as_bytes()).unwrap_or("")
}

fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

/// Depth-first visit of every node, anonymous nodes included.
fn walk_all<'tree>(root: Node<'tree>, f: &mut impl FnMut(Node<'tree>)) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        f(node);
        for i in (0..node.child_count()).rev() {
            if let Some(child) = node.child(i) {
                stack.push(child);
            }
        }
    }
}

/// Collect bare identifiers inside an assignment/loop target, skipping
/// attribute and subscript targets (those do not bind new names).
fn collect_target_identifiers(node: Node<'_>, code: &str, out: &mut HashSet<String>) {
    match node.kind() {
        "identifier" => {
            out.insert(node_text(node, code).to_string());
        }
        "attribute" | "subscript" => {}
        _ => {
            for i in 0..node.child_count() {
                if let Some(child) = node.child(i) {
                    collect_target_identifiers(child, code, out);
                }
            }
        }
    }
}

/// Collect parameter names from a `parameters`/`lambda_parameters` subtree.
fn collect_parameter_names(node: Node<'_>, code: &str, out: &mut HashSet<String>) {
    for i in 0..node.child_count() {
        let Some(child) = node.child(i) else { continue };
        match child.kind() {
            "identifier" => {
                out.insert(node_text(child, code).to_string());
            }
            "typed_parameter" | "list_splat_pattern" | "dictionary_splat_pattern" => {
                for j in 0..child.child_count() {
                    if let Some(inner) = child.child(j) {
                        if inner.kind() == "identifier" {
                            out.insert(node_text(inner, code).to_string());
                            break;
                        }
                    }
                }
            }
            "default_parameter" | "typed_default_parameter" => {
                if let Some(name) = child.child_by_field_name("name") {
                    out.insert(node_text(name, code).to_string());
                }
            }
            _ => {}
        }
    }
}

fn top_level_module(dotted: &str) -> &str {
    dotted.split('.').next().unwrap_or(dotted)
}

/// First pass: every name this module defines, binds, or imports.
fn collect_defined_names(root: Node<'_>, code: &str) -> HashSet<String> {
    let mut defined = HashSet::new();

    walk_all(root, &mut |node| match node.kind() {
        "function_definition" | "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                defined.insert(node_text(name, code).to_string());
            }
        }
        "parameters" | "lambda_parameters" => {
            collect_parameter_names(node, code, &mut defined);
        }
        "assignment" | "augmented_assignment" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_target_identifiers(left, code, &mut defined);
            }
        }
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                defined.insert(node_text(name, code).to_string());
            }
        }
        "for_statement" | "for_in_clause" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_target_identifiers(left, code, &mut defined);
            }
        }
        "as_pattern_target" => {
            collect_target_identifiers(node, code, &mut defined);
        }
        "global_statement" | "nonlocal_statement" => {
            for i in 0..node.child_count() {
                if let Some(child) = node.child(i) {
                    if child.kind() == "identifier" {
                        defined.insert(node_text(child, code).to_string());
                    }
                }
            }
        }
        "import_statement" => {
            for i in 0..node.child_count() {
                let Some(child) = node.child(i) else { continue };
                match child.kind() {
                    "dotted_name" => {
                        defined.insert(top_level_module(node_text(child, code)).to_string());
                    }
                    "aliased_import" => {
                        if let Some(alias) = child.child_by_field_name("alias") {
                            defined.insert(node_text(alias, code).to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        "import_from_statement" => {
            let module = node.child_by_field_name("module_name");
            for i in 0..node.child_count() {
                let Some(child) = node.child(i) else { continue };
                if Some(child) == module {
                    continue;
                }
                match child.kind() {
                    "dotted_name" => {
                        defined.insert(top_level_module(node_text(child, code)).to_string());
                    }
                    "aliased_import" => {
                        if let Some(alias) = child.child_by_field_name("alias") {
                            defined.insert(node_text(alias, code).to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    });

    defined
}

/// Whether an identifier node occupies a position that is not a bare-name
/// load (attribute access, keyword argument name, import machinery).
fn is_non_load_position(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return false;
    };
    match parent.kind() {
        "attribute" => parent
            .child_by_field_name("attribute")
            .map_or(false, |attr| attr == node),
        "keyword_argument" => parent
            .child_by_field_name("name")
            .map_or(false, |name| name == node),
        "dotted_name" | "aliased_import" | "import_statement" | "import_from_statement"
        | "relative_import" | "import_prefix" => true,
        _ => false,
    }
}

impl CodeParser for PythonParser {
    fn language(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn check_syntax(&self, code: &str) -> SyntaxCheck {
        let Some(tree) = self.parse(code) else {
            return SyntaxCheck::invalid("parser produced no tree");
        };

        let mut first_error: Option<String> = None;
        walk_all(tree.root_node(), &mut |node| {
            if first_error.is_some() {
                return;
            }
            if node.kind() == "ERROR" {
                first_error = Some(format!("syntax error at line {}", line_of(node)));
            } else if node.is_missing() {
                first_error = Some(format!(
                    "missing {} at line {}",
                    node.kind(),
                    line_of(node)
                ));
            }
        });

        match first_error {
            Some(error) => SyntaxCheck::invalid(error),
            None => SyntaxCheck::valid(),
        }
    }

    fn analyze(&self, code: &str, known_modules: &HashSet<String>) -> Option<SemanticFindings> {
        let tree = self.parse(code)?;
        let root = tree.root_node();

        let defined = collect_defined_names(root, code);
        let mut findings = SemanticFindings::default();
        let mut seen_undefined: HashSet<String> = HashSet::new();
        let mut seen_imports: HashSet<String> = HashSet::new();

        walk_all(root, &mut |node| {
            match node.kind() {
                "identifier" => {
                    if is_non_load_position(node) {
                        return;
                    }
                    let name = node_text(node, code);
                    if name.is_empty()
                        || defined.contains(name)
                        || PYTHON_BUILTINS.contains(&name)
                    {
                        return;
                    }
                    if seen_undefined.insert(name.to_string()) {
                        findings
                            .undefined_names
                            .push(NameFinding::new(name, line_of(node)));
                    }
                }
                "import_statement" | "import_from_statement" => {
                    let module_node = if node.kind() == "import_from_statement" {
                        node.child_by_field_name("module_name")
                    } else {
                        node.child_by_field_name("name").or_else(|| {
                            (0..node.child_count())
                                .filter_map(|i| node.child(i))
                                .find(|c| {
                                    c.kind() == "dotted_name" || c.kind() == "aliased_import"
                                })
                        })
                    };
                    let Some(module_node) = module_node else { return };
                    let dotted = if module_node.kind() == "aliased_import" {
                        module_node
                            .child_by_field_name("name")
                            .map(|n| node_text(n, code))
                            .unwrap_or_default()
                    } else {
                        node_text(module_node, code)
                    };
                    let module = top_level_module(dotted);
                    if module.is_empty()
                        || PYTHON_STDLIB_MODULES.contains(&module)
                        || known_modules.contains(module)
                    {
                        return;
                    }
                    if seen_imports.insert(module.to_string()) {
                        findings
                            .unresolved_imports
                            .push(NameFinding::new(module, line_of(node)));
                    }
                }
                _ => {}
            }
        });

        Some(findings)
    }
}
