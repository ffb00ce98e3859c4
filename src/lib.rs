//! Library entrypoint: re-export every module used by the importer binary
//! and the standalone forwarder/tester binaries.

pub mod bson_convert;
pub mod config;
pub mod controller;
pub mod debug_listener;
pub mod errors;
pub mod increments;
pub mod indexer;
pub mod live_stream;
pub mod messages;
pub mod metrics;
pub mod parser;
pub mod processor;
pub mod request_writer;
pub mod resource_registry;
pub mod stats_updater;
pub mod storage;
pub mod stream_registry;
pub mod subscriber;
pub mod wire;
