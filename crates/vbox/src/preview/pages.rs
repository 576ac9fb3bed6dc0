//! Static pages served by the preview proxy when no dev server answers.

use super::registry::PreviewKey;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const STYLE: &str = "body{margin:0;height:100vh;display:flex;align-items:center;\
justify-content:center;font-family:system-ui,sans-serif;background:#1e1e1e;color:#ccc}\
.box{text-align:center;max-width:32rem;padding:2rem}h1{font-size:1.25rem;color:#eee}\
code{background:#333;padding:.1rem .3rem;border-radius:3px}";

/// Page returned with `503` while no dev server is registered.
///
/// It polls the status endpoint and reloads once the target is available.
pub fn waiting_page(key: &PreviewKey) -> String {
    let status_url = format!(
        "/api/preview-status/{}/{}",
        urlencoding::encode(&key.project_id),
        urlencoding::encode(&key.user_id)
    );
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Waiting for dev server</title>
<style>{STYLE}</style>
</head>
<body>
<div class="box">
<h1>Waiting for the development server</h1>
<p>Start your dev server (for example <code>npm run dev</code>) in a terminal.
This page reloads automatically once it is ready.</p>
</div>
<script>
(function poll() {{
  fetch("{status_url}", {{ cache: "no-store" }})
    .then(function (r) {{ return r.json(); }})
    .then(function (s) {{ if (s.available) {{ location.reload(); }} else {{ setTimeout(poll, 2000); }} }})
    .catch(function () {{ setTimeout(poll, 2000); }});
}})();
</script>
</body>
</html>
"#,
        status_url = escape(&status_url),
    )
}

/// Page returned with `502` when the registered port refuses connections.
pub fn unreachable_page(port: u16) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Dev server not running</title>
<style>{STYLE}</style>
</head>
<body>
<div class="box">
<h1>Unable to connect to development server</h1>
<p>Port: <code>{port}</code></p>
<p>The server is not running. Restart it and reload this page.</p>
</div>
</body>
</html>
"#
    )
}

/// Page returned with `504` when the dev server does not answer in time.
pub fn timeout_page(port: u16) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Dev server timed out</title>
<style>{STYLE}</style>
</head>
<body>
<div class="box">
<h1>Development server did not respond</h1>
<p>Port: <code>{port}</code></p>
</div>
</body>
</html>
"#
    )
}

/// Full-page iframe around the proxied app.
pub fn iframe_page(key: &PreviewKey) -> String {
    let src = format!("{}/", key.prefix());
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Preview</title>
<style>html,body{{margin:0;height:100%;overflow:hidden}}iframe{{border:0;width:100%;height:100%}}</style>
</head>
<body>
<iframe src="{src}" sandbox="allow-scripts allow-same-origin allow-forms allow-modals allow-popups"></iframe>
</body>
</html>
"#,
        src = escape(&src),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_page_polls_status_endpoint() {
        let page = waiting_page(&PreviewKey::new("p1", "u1"));
        assert!(page.contains("/api/preview-status/p1/u1"));
        assert!(page.contains("location.reload()"));
    }

    #[test]
    fn iframe_points_at_proxy_prefix() {
        let page = iframe_page(&PreviewKey::new("p1", "u1"));
        assert!(page.contains(r#"src="/preview/p1/u1/""#));
    }

    #[test]
    fn unreachable_page_names_port() {
        let page = unreachable_page(5173);
        assert!(page.contains("Unable to connect to development server"));
        assert!(page.contains("5173"));
    }

    #[test]
    fn keys_are_escaped() {
        let page = iframe_page(&PreviewKey::new("<p>", "u"));
        assert!(!page.contains("<p>/"));
    }
}
