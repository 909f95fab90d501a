//! Import-driven package resolution
//!
//! A pure, side-effect-free scan of submitted Python source for the modules
//! it imports, so the controller can install missing packages before the
//! code runs. The scanner is a line-based heuristic: it understands the
//! `import a, b.c as d` and `from x.y import z` forms (including indented
//! and `;`-joined statements), skips comments and relative imports, filters
//! out the standard library, and maps well-known module names to the
//! distribution that provides them (e.g. `cv2` installs `opencv-python`).

/// Standard-library module roots that never need installation.
///
/// Sorted, for binary search.
const STDLIB_MODULES: &[&str] = &[
    "__future__",
    "abc",
    "argparse",
    "array",
    "ast",
    "asyncio",
    "base64",
    "binascii",
    "bisect",
    "builtins",
    "bz2",
    "calendar",
    "cmath",
    "codecs",
    "collections",
    "concurrent",
    "configparser",
    "contextlib",
    "contextvars",
    "copy",
    "csv",
    "ctypes",
    "dataclasses",
    "datetime",
    "decimal",
    "difflib",
    "dis",
    "email",
    "enum",
    "errno",
    "fnmatch",
    "fractions",
    "functools",
    "gc",
    "getpass",
    "gettext",
    "glob",
    "gzip",
    "hashlib",
    "heapq",
    "hmac",
    "html",
    "http",
    "importlib",
    "inspect",
    "io",
    "ipaddress",
    "itertools",
    "json",
    "keyword",
    "linecache",
    "locale",
    "logging",
    "lzma",
    "marshal",
    "math",
    "mimetypes",
    "multiprocessing",
    "numbers",
    "operator",
    "os",
    "pathlib",
    "pickle",
    "platform",
    "pprint",
    "queue",
    "random",
    "re",
    "reprlib",
    "secrets",
    "select",
    "selectors",
    "shlex",
    "shutil",
    "signal",
    "site",
    "socket",
    "sqlite3",
    "ssl",
    "stat",
    "statistics",
    "string",
    "struct",
    "subprocess",
    "sys",
    "sysconfig",
    "tarfile",
    "tempfile",
    "textwrap",
    "threading",
    "time",
    "timeit",
    "token",
    "tokenize",
    "traceback",
    "types",
    "typing",
    "unicodedata",
    "unittest",
    "urllib",
    "uuid",
    "warnings",
    "weakref",
    "webbrowser",
    "xml",
    "zipfile",
    "zlib",
    "zoneinfo",
];

/// Modules whose distribution name differs from the import name.
///
/// Sorted by module name, for binary search.
const MODULE_PACKAGE_ALIASES: &[(&str, &str)] = &[
    ("Crypto", "pycryptodome"),
    ("PIL", "pillow"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("docx", "python-docx"),
    ("dotenv", "python-dotenv"),
    ("fitz", "pymupdf"),
    ("sklearn", "scikit-learn"),
    ("yaml", "pyyaml"),
];

/// Top-level module names imported by `code`, first-seen order, deduplicated.
pub fn scan_imports(code: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for line in code.lines() {
        // Strip trailing comments before tokenizing.
        let line = line.split('#').next().unwrap_or("");
        for stmt in line.split(';') {
            scan_statement(stmt.trim(), &mut modules);
        }
    }
    modules
}

fn scan_statement(stmt: &str, modules: &mut Vec<String>) {
    if let Some(rest) = keyword_rest(stmt, "import") {
        // `import a, b.c as d`
        for part in rest.split(',') {
            if let Some(name) = part.trim().split_whitespace().next() {
                push_module(name, modules);
            }
        }
    } else if let Some(rest) = keyword_rest(stmt, "from") {
        // `from a.b import c` (relative imports resolve in-session)
        if let Some(name) = rest.split_whitespace().next()
            && !name.starts_with('.')
        {
            push_module(name, modules);
        }
    }
}

/// The remainder of `stmt` after a leading keyword, or `None` if the
/// statement does not start with that keyword as a whole word.
fn keyword_rest<'a>(stmt: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = stmt.strip_prefix(keyword)?;
    // `importlib.reload(x)` is not an import statement.
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim_start())
}

fn push_module(name: &str, modules: &mut Vec<String>) {
    let root = name.split('.').next().unwrap_or(name);
    if !is_identifier(root) {
        return;
    }
    if !modules.iter().any(|m| m == root) {
        modules.push(root.to_string());
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether a module root ships with the interpreter.
pub fn is_stdlib(module: &str) -> bool {
    STDLIB_MODULES.binary_search(&module).is_ok()
}

/// Distribution name that provides a module root.
pub fn package_for(module: &str) -> &str {
    match MODULE_PACKAGE_ALIASES.binary_search_by_key(&module, |(m, _)| m) {
        Ok(idx) => MODULE_PACKAGE_ALIASES[idx].1,
        Err(_) => module,
    }
}

/// Packages `code` needs installed: scanned imports minus the standard
/// library, mapped through the alias table, deduplicated in first-seen
/// order.
pub fn resolve_packages(code: &str) -> Vec<String> {
    let mut packages = Vec::new();
    for module in scan_imports(code) {
        if is_stdlib(&module) {
            continue;
        }
        let package = package_for(&module).to_string();
        if !packages.contains(&package) {
            packages.push(package);
        }
    }
    packages
}
