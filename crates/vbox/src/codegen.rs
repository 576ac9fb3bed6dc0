//! Inline code suggestions from an external AI endpoint.
//!
//! The endpoint's JSON answer is handed back to the editor untouched.

use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;

use crate::settings::CodegenConfig;

pub type CodegenResult<T> = Result<T, CodegenError>;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("Code generation is not configured")]
    Disabled,

    #[error("Code generation request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Code generation endpoint returned {status}")]
    UnexpectedStatus { status: u16 },
}

const SYSTEM_PROMPT: &str = "You are an expert coding assistant who reads from an existing code \
file, and suggests code to add to the file. You may be given instructions on what to generate, \
which you should follow. Generate code that is correct, efficient and easy to read.";

/// What the editor asked for.
#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub file_name: &'a str,
    pub code: &'a str,
    pub line: u32,
    pub instructions: &'a str,
}

impl GenerateRequest<'_> {
    fn messages(&self) -> Value {
        json!([
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": format!("The file is called {}.", self.file_name) },
            {
                "role": "user",
                "content": format!("Here are my instructions on what to generate: {}.", self.instructions),
            },
            {
                "role": "user",
                "content": format!(
                    "Suggest me code to insert at line {} in my file. Give only the code, and NOTHING else. \
                     DO NOT include backticks in your response. My code file content is as follows\n\n{}",
                    self.line, self.code
                ),
            },
        ])
    }
}

#[derive(Debug, Clone)]
pub struct CodeGenerator {
    client: Client,
    endpoint: Option<String>,
    token: Option<String>,
}

impl CodeGenerator {
    pub fn new(config: &CodegenConfig) -> CodegenResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            token: config.token.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    pub async fn generate(&self, request: &GenerateRequest<'_>) -> CodegenResult<Value> {
        let endpoint = self.endpoint.as_deref().ok_or(CodegenError::Disabled)?;
        let mut builder = self
            .client
            .post(endpoint)
            .json(&json!({ "messages": request.messages() }));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CodegenError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerateRequest<'static> {
        GenerateRequest {
            file_name: "main.rs",
            code: "fn main() {}",
            line: 1,
            instructions: "print hello",
        }
    }

    #[tokio::test]
    async fn forwards_response_verbatim() {
        let server = MockServer::start().await;
        let answer = json!({"result": {"response": "println!(\"hello\");"}, "success": true});
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer.clone()))
            .mount(&server)
            .await;

        let generator = CodeGenerator::new(&CodegenConfig {
            endpoint: Some(server.uri()),
            token: Some("t0k".into()),
        })
        .unwrap();
        assert!(generator.is_enabled());
        assert_eq!(generator.generate(&request()).await.unwrap(), answer);
    }

    #[tokio::test]
    async fn unconfigured_generator_is_disabled() {
        let generator = CodeGenerator::new(&CodegenConfig::default()).unwrap();
        assert!(matches!(
            generator.generate(&request()).await,
            Err(CodegenError::Disabled)
        ));
    }

    #[test]
    fn prompt_mentions_line_and_file() {
        let messages = request().messages();
        let text = messages.to_string();
        assert!(text.contains("The file is called main.rs."));
        assert!(text.contains("insert at line 1"));
    }
}
