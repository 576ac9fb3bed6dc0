//! Prefix rewriting for documents served by a bundler dev server.
//!
//! The dev server believes it lives at `/`, so it emits site-absolute URLs.
//! Under `/preview/<project>/<user>` those would bypass the proxy; this module
//! inserts the prefix into them. It is a pure text transform so it can be
//! tested without a socket.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Vite's marker for `\0`-prefixed virtual modules. Paths carrying it are
/// resolved internally by the bundler and never rewritten.
const VIRTUAL_MODULE_MARKER: &str = "__x00__";

/// Document classes the rewriter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Html,
    Script,
    Stylesheet,
}

impl DocumentKind {
    /// Classify a `Content-Type` header value.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => Some(Self::Html),
            "application/javascript" | "text/javascript" | "application/x-javascript"
            | "application/ecmascript" | "text/ecmascript" | "text/jsx" | "text/typescript"
            | "application/typescript" => Some(Self::Script),
            "text/css" => Some(Self::Stylesheet),
            _ => None,
        }
    }
}

/// One pattern per quote character, so a path only ends at the quote that
/// opened it. `stop` lists extra characters a path may not contain.
fn quoted(lead: &str, quotes: &[char], stop: &str) -> Vec<Regex> {
    quotes
        .iter()
        .map(|q| {
            Regex::new(&format!(
                r"(?P<lead>{lead})(?P<q>{q})(?P<path>/[^{q}{stop}]*){q}"
            ))
            .expect("quoted path pattern is valid")
        })
        .collect()
}

// `src="/..."` / `href='/...'`
static ATTRIBUTE: Lazy<Vec<Regex>> =
    Lazy::new(|| quoted(r"\b(?:src|href|action)\s*=\s*", &['"', '\''], ""));

// `import x from "/..."`, `export * from '/...'`, `import "/..."`
static STATIC_IMPORT: Lazy<Vec<Regex>> = Lazy::new(|| {
    quoted(
        r"\b(?:import|export)\b\s*(?:[\w*${},\s]*?\bfrom\s*)?",
        &['"', '\''],
        r"\n",
    )
});

// `import("/...")`
static DYNAMIC_IMPORT: Lazy<Vec<Regex>> =
    Lazy::new(|| quoted(r"\bimport\s*\(\s*", &['"', '\'', '`'], r"\n"));

// `url(/...)`, `url("/...")`
static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?P<lead>\burl\(\s*)(?P<q>["']?)(?P<path>/[^"')\s]*)"#)
        .expect("css url pattern is valid")
});

// `@import "/..."`
static CSS_IMPORT: Lazy<Vec<Regex>> = Lazy::new(|| quoted(r"@import\s+", &['"', '\''], ""));

/// Whether `path` should receive `prefix`.
fn needs_prefix(path: &str, prefix: &str) -> bool {
    if !path.starts_with('/') || path.starts_with("//") {
        return false;
    }
    if path == prefix || path.starts_with(&format!("{prefix}/")) {
        return false;
    }
    !path.contains(VIRTUAL_MODULE_MARKER)
}

fn apply<'a>(re: &Regex, text: &'a str, prefix: &str, closes_quote: bool) -> Cow<'a, str> {
    re.replace_all(text, |caps: &Captures<'_>| {
        let lead = &caps["lead"];
        let quote = caps.name("q").map(|m| m.as_str()).unwrap_or("");
        let path = &caps["path"];
        let path = if needs_prefix(path, prefix) {
            format!("{prefix}{path}")
        } else {
            path.to_string()
        };
        if closes_quote {
            format!("{lead}{quote}{path}{quote}")
        } else {
            format!("{lead}{quote}{path}")
        }
    })
}

fn apply_quoted(patterns: &[Regex], text: &str, prefix: &str) -> String {
    patterns.iter().fold(text.to_string(), |acc, re| {
        apply(re, &acc, prefix, true).into_owned()
    })
}

fn rewrite_script(body: &str, prefix: &str) -> String {
    let pass = apply_quoted(&STATIC_IMPORT, body, prefix);
    apply_quoted(&DYNAMIC_IMPORT, &pass, prefix)
}

fn rewrite_stylesheet(body: &str, prefix: &str) -> String {
    let pass = apply_quoted(&CSS_IMPORT, body, prefix);
    apply(&CSS_URL, &pass, prefix, false).into_owned()
}

fn rewrite_html(body: &str, prefix: &str) -> String {
    let pass = apply_quoted(&ATTRIBUTE, body, prefix);
    // Inline module scripts carry import statements too.
    let pass = rewrite_script(&pass, prefix);
    apply(&CSS_URL, &pass, prefix, false).into_owned()
}

/// Module script that exposes the prefix as `window.__BASE_URL__` and
/// prefixes absolute paths handed to `fetch` and `window.__import` at
/// runtime. Bundler internals (`/@...`) and `node_modules` paths pass
/// through.
fn base_url_script(prefix: &str) -> String {
    let base = serde_json::Value::from(prefix)
        .to_string()
        .replace('<', "\\u003c");
    format!(
        r#"<script type="module">
const base = {base};
window.__BASE_URL__ = base;
const prefixed = (path) =>
  typeof path === "string" &&
  path.startsWith("/") &&
  !path.startsWith("//") &&
  path !== base &&
  !path.startsWith(base + "/") &&
  !path.startsWith("/@") &&
  !path.includes("node_modules")
    ? base + path
    : path;
const originalFetch = window.fetch;
window.fetch = function (input, init) {{
  return originalFetch.call(this, prefixed(input), init);
}};
const originalImport = window.__import || ((id) => import(id));
window.__import = (id) => originalImport(prefixed(id));
</script>
"#
    )
}

/// Place the base URL script before `</head>`, or at the very start when
/// the document has no head.
fn inject_base_url(html: String, prefix: &str) -> String {
    let script = base_url_script(prefix);
    match html.to_ascii_lowercase().find("</head>") {
        Some(at) => {
            let mut out = String::with_capacity(html.len() + script.len());
            out.push_str(&html[..at]);
            out.push_str(&script);
            out.push_str(&html[at..]);
            out
        }
        None => script + &html,
    }
}

/// Rewrite absolute references in `body` so they stay under `prefix`.
///
/// `prefix` has no trailing slash, e.g. `/preview/p1/u1`. HTML documents
/// also get the base URL script. Bodies with an unrecognized content type
/// are returned untouched.
pub fn rewrite_body(content_type: &str, prefix: &str, body: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    match DocumentKind::from_content_type(content_type) {
        Some(DocumentKind::Html) => inject_base_url(rewrite_html(body, prefix), prefix),
        Some(DocumentKind::Script) => rewrite_script(body, prefix),
        Some(DocumentKind::Stylesheet) => rewrite_stylesheet(body, prefix),
        None => body.to_string(),
    }
}
