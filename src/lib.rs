#![forbid(unsafe_code)]

//! Proxy backend that resolves video URLs through yt-dlp and exposes a small
//! set of download options to the web client.

pub mod api;
pub mod config;
pub mod extractor;
pub mod formats;
pub mod video_url;
