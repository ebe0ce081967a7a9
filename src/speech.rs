use std::io::Cursor;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rodio::{Decoder, OutputStream, Sink};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::SpeechConfig;

/// Turns text into audio bytes. Speaking rate is fixed at construction.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// OpenAI speech endpoint. Returns mp3 bytes.
pub struct OpenAiTts {
    api_key: String,
    model: String,
    voice: String,
    speed: f32,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(api_key: &str, config: &SpeechConfig) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct SpeechRequestBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

#[async_trait]
impl Synthesizer for OpenAiTts {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let body = SpeechRequestBody {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "mp3",
            speed: self.speed,
        };
        tracing::info!("Synthesizing speech with model={}", self.model);
        let bytes = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes)
    }
}

/// Plays an utterance through the audio output device, returning once
/// playback has finished.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: Bytes) -> Result<()>;
}

struct PlayRequest {
    audio: Bytes,
    done: oneshot::Sender<Result<()>>,
}

/// Output-device playback via rodio.
///
/// The stream and sink are not Send, so a dedicated thread owns them and
/// takes requests over a channel. The device is opened lazily on the first
/// utterance; an open failure is reported per call, not at startup.
pub struct RodioSink {
    tx: Mutex<mpsc::Sender<PlayRequest>>,
}

impl RodioSink {
    pub fn new(volume: f32) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<PlayRequest>();
        thread::Builder::new()
            .name("speech-audio".to_string())
            .spawn(move || audio_thread(volume, rx))
            .context("Spawning the audio playback thread")?;
        Ok(Self { tx: Mutex::new(tx) })
    }
}

fn audio_thread(volume: f32, rx: mpsc::Receiver<PlayRequest>) {
    // The stream handle must outlive the sink that plays through it
    let mut stream: Option<OutputStream> = None;
    let mut sink: Option<Sink> = None;
    while let Ok(request) = rx.recv() {
        let result = play_one(volume, &mut stream, &mut sink, request.audio);
        let _ = request.done.send(result);
    }
}

fn play_one(
    volume: f32,
    stream: &mut Option<OutputStream>,
    sink: &mut Option<Sink>,
    audio: Bytes,
) -> Result<()> {
    if sink.is_none() {
        let (s, handle) = OutputStream::try_default().context("Opening the audio output device")?;
        let new_sink = Sink::try_new(&handle).context("Creating the audio sink")?;
        new_sink.set_volume(volume);
        *stream = Some(s);
        *sink = Some(new_sink);
    }
    let Some(sink) = sink.as_ref() else {
        return Err(anyhow!("Audio sink unavailable"));
    };
    let source = Decoder::new(Cursor::new(audio)).context("Decoding the synthesized audio")?;
    sink.append(source);
    // Block until the utterance finishes; no cancellation
    sink.sleep_until_end();
    Ok(())
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, audio: Bytes) -> Result<()> {
        let (done, finished) = oneshot::channel();
        self.tx
            .lock()
            .map_err(|_| anyhow!("Audio thread channel poisoned"))?
            .send(PlayRequest { audio, done })
            .context("The audio playback thread is gone")?;
        finished
            .await
            .context("The audio playback thread dropped the request")?
    }
}

/// Speech output for the session: synthesize, then play to completion.
///
/// Rate and volume are baked into the synthesizer and sink at construction
/// and apply to every utterance.
#[derive(Clone)]
pub struct SpeechOutput {
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
}

impl SpeechOutput {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, sink: Arc<dyn AudioSink>) -> Self {
        Self { synthesizer, sink }
    }

    /// Convert text to speech. Returns after playback completes.
    pub async fn speak(&self, text: &str) -> Result<()> {
        let audio = self.synthesizer.synthesize(text).await?;
        self.sink.play(audio).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records what it was asked to play instead of touching a device.
    struct RecordingSink {
        played: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, audio: Bytes) -> Result<()> {
            assert_eq!(audio, Bytes::from_static(b"mp3-bytes"));
            self.played.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl AudioSink for BrokenSink {
        async fn play(&self, _audio: Bytes) -> Result<()> {
            Err(anyhow!("no audio device"))
        }
    }

    #[tokio::test]
    async fn speak_plays_the_synthesized_audio() {
        let mut synth = MockSynthesizer::new();
        synth
            .expect_synthesize()
            .withf(|text| text == "hello there")
            .times(1)
            .returning(|_| Ok(Bytes::from_static(b"mp3-bytes")));
        let sink = Arc::new(RecordingSink {
            played: AtomicUsize::new(0),
        });
        let speech = SpeechOutput::new(Arc::new(synth), sink.clone());
        speech.speak("hello there").await.unwrap();
        assert_eq!(sink.played.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn synthesis_failure_surfaces_as_error() {
        let mut synth = MockSynthesizer::new();
        synth
            .expect_synthesize()
            .returning(|_| Err(anyhow!("quota exceeded")));
        let speech = SpeechOutput::new(Arc::new(synth), Arc::new(BrokenSink));
        let err = speech.speak("hello").await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn playback_failure_surfaces_as_error() {
        let mut synth = MockSynthesizer::new();
        synth
            .expect_synthesize()
            .returning(|_| Ok(Bytes::from_static(b"mp3-bytes")));
        let speech = SpeechOutput::new(Arc::new(synth), Arc::new(BrokenSink));
        let err = speech.speak("hello").await.unwrap_err();
        assert!(err.to_string().contains("no audio device"));
    }
}
