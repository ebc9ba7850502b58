//! Capture collaborators
//!
//! The capture surface shared with the mirroring source, the collaborator
//! traits, microphone capture, and synthetic sources.

pub mod microphone;
pub mod surface;
pub mod synthetic;
pub mod traits;

pub use microphone::{MicrophoneSource, PcmConverter};
pub use surface::CaptureSurface;
pub use synthetic::{SilenceSource, TestPatternSource, ToneSource};
pub use traits::{AudioSource, HostLifecycle, MirrorSource, NoopLifecycle};
