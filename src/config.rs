use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
}

impl Config {
    /// Load the configuration from a YAML file.
    pub fn load(yml_path: &str) -> anyhow::Result<Self> {
        let yml = std::fs::read_to_string(yml_path)?;
        let config = serde_yaml::from_str(&yml)?;
        Ok(config)
    }

    /// Load the configuration from a YAML file, falling back to the defaults
    /// when the file does not exist. A file that exists but fails to parse is
    /// still a startup error.
    pub fn load_or_default(yml_path: &str) -> anyhow::Result<Self> {
        if std::fs::exists(yml_path)? {
            Self::load(yml_path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    pub tls: Option<TLSConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            tls: None,
        }
    }
}

fn default_address() -> String {
    "0.0.0.0:3000".into()
}

#[derive(Clone, Debug, Deserialize)]
pub struct TLSConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VisionConfig {
    /// Which hosted multimodal model answers the analysis prompts
    #[serde(default = "default_vision_model")]
    pub model: String,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model: default_vision_model(),
        }
    }
}

fn default_vision_model() -> String {
    "gpt-4o-mini".into()
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_speech_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Speaking rate multiplier, fixed for the lifetime of the engine
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Playback volume in [0, 1], fixed for the lifetime of the engine
    #[serde(default = "default_volume")]
    pub volume: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            model: default_speech_model(),
            voice: default_voice(),
            speed: default_speed(),
            volume: default_volume(),
        }
    }
}

fn default_speech_model() -> String {
    "tts-1".into()
}

fn default_voice() -> String {
    "nova".into()
}

fn default_speed() -> f32 {
    1.0
}

fn default_volume() -> f32 {
    0.8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_fields_missing() {
        let config: Config = serde_yaml::from_str("server:\n  address: 127.0.0.1:8080\n").unwrap();
        assert_eq!(config.server.address, "127.0.0.1:8080");
        assert!(config.server.tls.is_none());
        assert_eq!(config.vision.model, "gpt-4o-mini");
        assert_eq!(config.speech.voice, "nova");
        assert_eq!(config.speech.volume, 0.8);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("does-not-exist.yml").unwrap();
        assert_eq!(config.server.address, "0.0.0.0:3000");
        assert_eq!(config.speech.speed, 1.0);
    }
}
