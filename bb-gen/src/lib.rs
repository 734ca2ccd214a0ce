//! Client for the hosted image-generation API.
//!
//! Pure HTTP plus response parsing; knows nothing about chat platforms or
//! local files.

mod client;
mod dispatcher;
mod error;
mod extract;
mod request;
mod types;

pub use client::{
    ClientOptions, DEFAULT_BASE_URL, GenerationTransport, OpenRouterClient, ProbeReport, ProbeStatus,
};
pub use dispatcher::{ResilientDispatcher, RetryPolicy, Sleeper, TokioSleeper};
pub use error::{GenError, Result};
pub use extract::extract_artifacts;
pub use request::{
    BLEND_SOURCES_MAX, BLEND_SOURCES_MIN, RequestOptions, blend_request, edit_request,
    generate_request,
};
pub use types::{
    ArtifactSource, ChatMessage, ContentPart, GenerationRequest, ImageUrl, JobArtifact,
    Provenance, Role,
};
