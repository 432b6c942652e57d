//! Synthesis collaborators: the per-voice engines branches call into.

pub mod abort;
pub mod guard;
pub mod synthesizer;

pub use abort::{AbortHandle, AbortWatch, abort_pair};
pub use guard::SynthesisGuard;
pub use synthesizer::{EchoSynthesizer, MockSynthesizer, SynthesisRequest, Synthesizer};
