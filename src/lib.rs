pub mod archive;
pub mod background;
pub mod config;
pub mod error;
pub mod frame_batcher;
pub mod frame_extractor;
pub mod input_recognizer;
pub mod logger;
pub mod recognizer;
pub mod replay_analyzer;
pub mod round_analyzer;
pub mod sf6;
pub mod storage;
