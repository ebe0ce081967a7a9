use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
    },
    Client,
};
use async_trait::async_trait;
use base64::Engine;
#[cfg(test)]
use mockall::automock;
use strum::EnumString;

/// Convert a webp image to a data URL
pub fn to_data_url(bytes: &[u8]) -> String {
    format!(
        "data:image/webp;base64,{}",
        // For the purpose of data urls, you do NOT need to use the URL_SAFE variant
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// The three kinds of assistance the app can provide for an image.
///
/// The order of `ALL` is the order analyses run in when several are selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AnalysisKind {
    Scene,
    Text,
    Objects,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 3] = [Self::Scene, Self::Text, Self::Objects];

    /// The instruction sent to the model alongside the image.
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::Scene => {
                "Provide a comprehensive and detailed description of the scene. \
                 Focus on key elements, colors, objects, and spatial relationships. \
                 Describe the scene as if explaining it to a visually impaired person."
            }
            Self::Text => {
                "Extract all readable text from this image. \
                 Provide the text exactly as it appears."
            }
            Self::Objects => {
                "Identify and list all distinct objects in this image. \
                 For each object, provide its location and potential significance. \
                 Prioritize objects that might impact navigation or safety."
            }
        }
    }

    /// Prefix used when a remote call fails and the failure becomes the result text.
    pub fn failure_prefix(&self) -> &'static str {
        match self {
            Self::Scene => "Error in scene description",
            Self::Text => "Text extraction error",
            Self::Objects => "Object detection error",
        }
    }
}

/// The remote multimodal model, reduced to the one call this app makes:
/// an instruction plus an image in, generated text out.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn generate(&self, instruction: &str, image_webp: &[u8]) -> Result<String>;
}

/// Hosted vision-language model reached through the OpenAI chat API.
pub struct OpenAiVision {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiVision {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: Client::with_config(OpenAIConfig::new().with_api_key(api_key)),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl VisionBackend for OpenAiVision {
    async fn generate(&self, instruction: &str, image_webp: &[u8]) -> Result<String> {
        // The API supports DataURI images, so the webp bytes get base64-wrapped.
        let img_data_url = to_data_url(image_webp);
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(vec![
                    ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(instruction)
                        .build()?
                        .into(),
                    ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(
                            ImageUrlArgs::default()
                                .url(img_data_url)
                                .detail(ImageDetail::High)
                                .build()?,
                        )
                        .build()?
                        .into(),
                ])
                .build()?
                .into()])
            .build()?;
        self.client
            .chat()
            .create(request)
            .await?
            .choices
            .first()
            .ok_or(anyhow!("No response from the model"))?
            .message
            .content
            .clone()
            .ok_or(anyhow!("No message content in the model response"))
    }
}

/// Visual analysis client: three operations over one backend, differing only
/// in instruction text and failure prefix.
///
/// Every operation returns a string. A remote failure is caught and rendered
/// as the result, so the caller always has something to display and speak.
#[derive(Clone)]
pub struct VisionClient {
    backend: Arc<dyn VisionBackend>,
}

impl VisionClient {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self { backend }
    }

    pub async fn describe_scene(&self, image_webp: &[u8]) -> String {
        self.analyze(AnalysisKind::Scene, image_webp).await
    }

    pub async fn extract_text(&self, image_webp: &[u8]) -> String {
        self.analyze(AnalysisKind::Text, image_webp).await
    }

    pub async fn detect_objects(&self, image_webp: &[u8]) -> String {
        self.analyze(AnalysisKind::Objects, image_webp).await
    }

    /// Run one analysis kind against the image.
    pub async fn analyze(&self, kind: AnalysisKind, image_webp: &[u8]) -> String {
        tracing::info!("Running {:?} analysis", kind);
        match self.backend.generate(kind.instruction(), image_webp).await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("{:?} analysis failed: {:#}", kind, err);
                format!("{}: {:#}", kind.failure_prefix(), err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(backend: MockVisionBackend) -> VisionClient {
        VisionClient::new(Arc::new(backend))
    }

    #[tokio::test]
    async fn successful_call_returns_model_text_verbatim() {
        let mut backend = MockVisionBackend::new();
        backend
            .expect_generate()
            .returning(|_, _| Ok("A fluffy cat sits on a red sofa.".to_string()));
        let client = client_with(backend);
        assert_eq!(
            client.describe_scene(b"webp").await,
            "A fluffy cat sits on a red sofa."
        );
    }

    #[tokio::test]
    async fn each_kind_sends_its_own_instruction() {
        let mut backend = MockVisionBackend::new();
        backend
            .expect_generate()
            .withf(|instruction, _| instruction.contains("visually impaired person"))
            .times(1)
            .returning(|_, _| Ok("scene".into()));
        backend
            .expect_generate()
            .withf(|instruction, _| instruction.contains("exactly as it appears"))
            .times(1)
            .returning(|_, _| Ok("text".into()));
        backend
            .expect_generate()
            .withf(|instruction, _| instruction.contains("navigation or safety"))
            .times(1)
            .returning(|_, _| Ok("objects".into()));
        let client = client_with(backend);
        assert_eq!(client.describe_scene(b"img").await, "scene");
        assert_eq!(client.extract_text(b"img").await, "text");
        assert_eq!(client.detect_objects(b"img").await, "objects");
    }

    #[tokio::test]
    async fn failures_become_labelled_result_text() {
        let mut backend = MockVisionBackend::new();
        backend
            .expect_generate()
            .returning(|_, _| Err(anyhow!("connection timed out")));
        let client = client_with(backend);

        let scene = client.describe_scene(b"img").await;
        assert!(scene.starts_with("Error in scene description:"));
        assert!(scene.contains("connection timed out"));

        let text = client.extract_text(b"img").await;
        assert!(text.starts_with("Text extraction error:"));

        let objects = client.detect_objects(b"img").await;
        assert!(objects.starts_with("Object detection error:"));
    }

    #[test]
    fn kind_parses_from_route_segment() {
        use std::str::FromStr;
        assert_eq!(AnalysisKind::from_str("scene").unwrap(), AnalysisKind::Scene);
        assert_eq!(AnalysisKind::from_str("text").unwrap(), AnalysisKind::Text);
        assert_eq!(
            AnalysisKind::from_str("objects").unwrap(),
            AnalysisKind::Objects
        );
        assert!(AnalysisKind::from_str("bogus").is_err());
    }

    #[test]
    fn data_url_is_webp_base64() {
        assert_eq!(to_data_url(b"abc"), "data:image/webp;base64,YWJj");
    }
}
