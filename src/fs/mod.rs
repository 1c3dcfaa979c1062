//! Storage-facing services above raw block devices.

pub mod bcache;
