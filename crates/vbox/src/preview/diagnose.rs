//! Inspection of a mirrored project to explain why a preview is missing.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use super::registry::ServerKind;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDiagnosis {
    pub project_dir_exists: bool,
    pub has_package_json: bool,
    pub dev_script: Option<String>,
    pub framework: Option<ServerKind>,
    pub uses_react: bool,
    pub has_bundler_config: bool,
    pub has_index_html: bool,
    pub has_src_dir: bool,
    pub suggestions: Vec<String>,
}

const BUNDLER_CONFIGS: &[&str] = &[
    "vite.config.js",
    "vite.config.ts",
    "vite.config.mjs",
    "vite.config.mts",
];

fn has_dependency(manifest: &Value, name: &str) -> bool {
    ["dependencies", "devDependencies"]
        .iter()
        .any(|section| manifest.get(section).and_then(|deps| deps.get(name)).is_some())
}

/// Inspect `dir` (a project's mirror directory).
pub async fn diagnose_project(dir: &Path) -> ProjectDiagnosis {
    let mut report = ProjectDiagnosis {
        project_dir_exists: tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()),
        ..Default::default()
    };
    if !report.project_dir_exists {
        report
            .suggestions
            .push("Project files have not been loaded yet; open the project first.".to_string());
        return report;
    }

    if let Ok(raw) = tokio::fs::read_to_string(dir.join("package.json")).await {
        report.has_package_json = true;
        match serde_json::from_str::<Value>(&raw) {
            Ok(manifest) => {
                report.dev_script = manifest
                    .get("scripts")
                    .and_then(|s| s.get("dev").or_else(|| s.get("start")))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                report.uses_react = has_dependency(&manifest, "react");
                report.framework = if has_dependency(&manifest, "vite") {
                    Some(ServerKind::Vite)
                } else if has_dependency(&manifest, "next") {
                    Some(ServerKind::Next)
                } else {
                    None
                };
            }
            Err(e) => report
                .suggestions
                .push(format!("package.json is not valid JSON: {e}")),
        }
    }

    for name in BUNDLER_CONFIGS {
        if tokio::fs::metadata(dir.join(name)).await.is_ok() {
            report.has_bundler_config = true;
            break;
        }
    }
    report.has_index_html = tokio::fs::metadata(dir.join("index.html")).await.is_ok();
    report.has_src_dir = tokio::fs::metadata(dir.join("src"))
        .await
        .is_ok_and(|m| m.is_dir());

    if !report.has_package_json {
        report
            .suggestions
            .push("No package.json found; create one with a \"dev\" script.".to_string());
    } else if report.dev_script.is_none() {
        report
            .suggestions
            .push("package.json has no \"dev\" or \"start\" script.".to_string());
    }
    if report.framework == Some(ServerKind::Vite) && !report.has_index_html {
        report
            .suggestions
            .push("Vite projects need an index.html at the project root.".to_string());
    }
    if report.framework.is_none() && report.has_package_json {
        report.suggestions.push(
            "No known dev server dependency (vite, next); the preview relies on generic detection."
                .to_string(),
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let report = diagnose_project(&dir.path().join("nope")).await;
        assert!(!report.project_dir_exists);
        assert_eq!(report.suggestions.len(), 1);
    }

    #[tokio::test]
    async fn vite_react_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"dev":"vite"},"dependencies":{"react":"^18"},"devDependencies":{"vite":"^5"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("vite.config.ts"), "export default {}").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();

        let report = diagnose_project(dir.path()).await;
        assert!(report.has_package_json);
        assert_eq!(report.dev_script.as_deref(), Some("vite"));
        assert_eq!(report.framework, Some(ServerKind::Vite));
        assert!(report.uses_react);
        assert!(report.has_bundler_config);
        assert!(report.has_src_dir);
        assert!(!report.has_index_html);
        assert!(report.suggestions.iter().any(|s| s.contains("index.html")));
    }
}
