pub mod answer_parser;
pub mod browser;
pub mod challenge_solver;
pub mod credential_store;
pub mod session_manager;
pub mod stream_transcoder;

pub use session_manager::SessionManager;
pub use stream_transcoder::StreamTranscoder;
