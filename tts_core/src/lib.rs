//! Text-to-speech core: two ONNX engines behind one routing service.
//!
//! English goes to Piper, a fixed set of other languages to the MMS VITS
//! models when they are installed. [`TtsService`] adds the result cache and
//! the chunked streaming pipeline on top.

pub mod audio;
pub mod engine;
pub mod error;
pub mod mms;
pub mod model;
pub mod piper;
pub mod router;
pub mod segment;
pub mod service;
pub mod stats;
pub mod wav;

pub use audio::AudioChunk;
pub use engine::{EngineHealth, EngineRequest, TtsEngine};
pub use error::{Result, TtsError};
pub use mms::{ExecutionBackend, MmsEngine};
pub use model::{LoadState, ModelProxy};
pub use piper::{PiperEngine, PiperVoiceEntry};
pub use router::{select_engine, EngineId};
pub use service::{
    BatchResult, FrameStream, HealthReport, StreamFrame, SynthesisRequest, TtsService, TtsSettings, VoiceCatalog,
};
pub use stats::{TtsStats, TtsStatsSnapshot};
