#![forbid(unsafe_code)]

//! Recognizes YouTube video URLs and resolves the stable video id.

use url::Url;

const VIDEO_ID_LEN: usize = 11;

/// Hosts that carry the id in the `v` query parameter.
const QUERY_HOSTS: [&str; 5] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "gaming.youtube.com",
];

/// Hosts that carry the id in a path segment after one of `PATH_PREFIXES`.
const PATH_HOSTS: [&str; 5] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
];

const PATH_PREFIXES: [&str; 4] = ["embed", "v", "shorts", "live"];

const SHORT_HOST: &str = "youtu.be";

/// Returns the 11-character video id for a supported URL, or `None` when the
/// input is not a recognizable video link.
pub fn video_id(input: &str) -> Option<String> {
    let url = Url::parse(input.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();

    let candidate: Option<String> = if host == SHORT_HOST {
        url.path_segments()?.next().map(str::to_string)
    } else {
        let from_query = QUERY_HOSTS
            .contains(&host.as_str())
            .then(|| {
                url.query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned())
            })
            .flatten();
        from_query.or_else(|| {
            if !PATH_HOSTS.contains(&host.as_str()) {
                return None;
            }
            let mut segments = url.path_segments()?;
            let prefix = segments.next()?;
            if !PATH_PREFIXES.contains(&prefix) {
                return None;
            }
            segments.next().map(str::to_string)
        })
    };

    // Anything past the first 11 characters is ignored.
    candidate
        .map(|id| id.chars().take(VIDEO_ID_LEN).collect::<String>())
        .filter(|id| is_valid_id(id))
}

fn is_valid_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Canonical watch page handed to the extractor, free of playlist or
/// timestamp parameters from the original link.
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Player URL that can be framed by the web client.
pub fn embed_url(video_id: &str) -> String {
    format!("https://www.youtube.com/embed/{video_id}")
}
