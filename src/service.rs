use log::{debug, info, warn};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::RemoteConfig;
use crate::scrobble::{ScrobblePayload, Track};

/// Upper bound on scrobbles per `track.scrobble` request.
pub const MAX_BATCH: usize = 50;

const LIBREFM_CLIENT_KEY: &str = "perch";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {code}: {message}")]
    Api { code: String, message: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("{source} (after delivering {delivered} scrobbles)")]
    Partial {
        delivered: usize,
        #[source]
        source: Box<RemoteError>,
    },
}

impl RemoteError {
    /// Scrobbles the service accepted before the request failed.
    pub fn delivered(&self) -> usize {
        match self {
            RemoteError::Partial { delivered, .. } => *delivered,
            _ => 0,
        }
    }
}

/// Egress to the scrobbling service.
pub trait RemoteReporter {
    fn report_now_playing(&self, track: &Track) -> Result<(), RemoteError>;

    fn report_batch(&self, payloads: &[ScrobblePayload]) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    LastFm,
    LibreFm,
}

impl Service {
    pub fn base_url(self) -> &'static str {
        match self {
            Service::LastFm => "https://ws.audioscrobbler.com/2.0/",
            Service::LibreFm => "https://libre.fm/2.0/",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Service::LastFm => "Last.fm",
            Service::LibreFm => "Libre.fm",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceKeys {
    pub api_key: String,
    pub api_secret: String,
}

impl ServiceKeys {
    pub fn for_remote(remote: &RemoteConfig) -> Self {
        match remote.service {
            Service::LibreFm => Self {
                api_key: remote
                    .api_key
                    .clone()
                    .unwrap_or_else(|| LIBREFM_CLIENT_KEY.to_string()),
                api_secret: remote
                    .api_secret
                    .clone()
                    .unwrap_or_else(|| LIBREFM_CLIENT_KEY.to_string()),
            },
            Service::LastFm => Self {
                api_key: remote.api_key.clone().unwrap_or_default(),
                api_secret: remote.api_secret.clone().unwrap_or_default(),
            },
        }
    }
}

pub struct ScrobbleClient {
    service: Service,
    keys: ServiceKeys,
    session_key: String,
    http: Client,
}

impl ScrobbleClient {
    /// Logs in with the md5 password hash and returns a client holding the session key.
    pub fn login(
        service: Service,
        keys: ServiceKeys,
        username: &str,
        password_md5: &str,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder().build()?;
        let session_key = fetch_mobile_session(&http, service, &keys, username, password_md5)?;
        info!("Logged in to {} as {username}", service.name());
        Ok(Self {
            service,
            keys,
            session_key,
            http,
        })
    }

    /// Rebuilds a client from a session obtained earlier, without a network round trip.
    pub fn with_session(
        service: Service,
        keys: ServiceKeys,
        session_key: String,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder().build()?;
        Ok(Self {
            service,
            keys,
            session_key,
            http,
        })
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    fn call(&self, mut params: Vec<(String, String)>) -> Result<String, RemoteError> {
        params.push(("api_key".to_string(), self.keys.api_key.clone()));
        params.push(("sk".to_string(), self.session_key.clone()));
        let api_sig = sign_params(&params, &self.keys.api_secret);
        params.push(("api_sig".to_string(), api_sig));
        params.push(("format".to_string(), "json".to_string()));
        let text = self
            .http
            .post(self.service.base_url())
            .form(&params)
            .send()?
            .text()?;
        debug!("Response from {}: {}", self.service.base_url(), text);
        check_api_error(&text)?;
        Ok(text)
    }
}

impl RemoteReporter for ScrobbleClient {
    fn report_now_playing(&self, track: &Track) -> Result<(), RemoteError> {
        debug!("Updating now playing: {} - {}", track.artist, track.title);
        let mut params = vec![
            ("method".to_string(), "track.updateNowPlaying".to_string()),
            ("artist".to_string(), track.artist.clone()),
            ("track".to_string(), track.title.clone()),
        ];
        push_optional_fields(&mut params, track, None);
        self.call(params)?;
        info!("Broadcast now playing to {}", self.service.name());
        Ok(())
    }

    fn report_batch(&self, payloads: &[ScrobblePayload]) -> Result<(), RemoteError> {
        submit_in_chunks(payloads, MAX_BATCH, |chunk| {
            let text = self.call(scrobble_params(chunk))?;
            let summary = summarize_scrobbles(&text)?;
            for message in &summary.ignored_messages {
                warn!("{} ignored a scrobble: {message}", self.service.name());
            }
            debug!(
                "{} accepted {} and ignored {} scrobbles",
                self.service.name(),
                summary.accepted,
                summary.ignored
            );
            Ok(())
        })
    }
}

/// Submits `payloads` in chunks of `size`. A failure after the first chunk is
/// wrapped in `RemoteError::Partial` with the count already delivered.
pub fn submit_in_chunks(
    payloads: &[ScrobblePayload],
    size: usize,
    mut submit: impl FnMut(&[ScrobblePayload]) -> Result<(), RemoteError>,
) -> Result<(), RemoteError> {
    let mut delivered = 0;
    for chunk in payloads.chunks(size) {
        if let Err(err) = submit(chunk) {
            if delivered == 0 {
                return Err(err);
            }
            return Err(RemoteError::Partial {
                delivered,
                source: Box::new(err),
            });
        }
        delivered += chunk.len();
    }
    Ok(())
}

fn scrobble_params(payloads: &[ScrobblePayload]) -> Vec<(String, String)> {
    let mut params = vec![("method".to_string(), "track.scrobble".to_string())];
    for (index, payload) in payloads.iter().enumerate() {
        let track = &payload.track;
        params.push((format!("artist[{index}]"), track.artist.clone()));
        params.push((format!("track[{index}]"), track.title.clone()));
        params.push((format!("timestamp[{index}]"), payload.timestamp.to_string()));
        push_optional_fields(&mut params, track, Some(index));
    }
    params
}

fn push_optional_fields(params: &mut Vec<(String, String)>, track: &Track, index: Option<usize>) {
    let key = |name: &str| match index {
        Some(index) => format!("{name}[{index}]"),
        None => name.to_string(),
    };
    if let Some(album) = &track.album {
        params.push((key("album"), album.clone()));
    }
    if let Some(album_artist) = &track.album_artist {
        params.push((key("albumArtist"), album_artist.clone()));
    }
    if let Some(duration) = track.duration {
        params.push((key("duration"), duration.to_string()));
    }
}

fn fetch_mobile_session(
    http: &Client,
    service: Service,
    keys: &ServiceKeys,
    username: &str,
    password_md5: &str,
) -> Result<String, RemoteError> {
    let auth_token = format!("{:x}", md5::compute(format!("{username}{password_md5}")));
    let mut params = vec![
        ("method".to_string(), "auth.getMobileSession".to_string()),
        ("username".to_string(), username.to_string()),
        ("authToken".to_string(), auth_token),
        ("api_key".to_string(), keys.api_key.clone()),
    ];
    let api_sig = sign_params(&params, &keys.api_secret);
    params.push(("api_sig".to_string(), api_sig));
    params.push(("format".to_string(), "json".to_string()));
    let text = http
        .post(service.base_url())
        .form(&params)
        .send()?
        .text()?;
    check_api_error(&text)?;
    let json: Value = serde_json::from_str(&text)
        .map_err(|err| RemoteError::Malformed(format!("session response: {err}")))?;
    json.get("session")
        .and_then(|session| session.get("key"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Malformed("missing session key".to_string()))
}

fn sign_params(params: &[(String, String)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut signature = String::new();
    for (key, value) in sorted {
        signature.push_str(&key);
        signature.push_str(&value);
    }
    signature.push_str(secret);
    format!("{:x}", md5::compute(signature))
}

fn check_api_error(payload: &str) -> Result<(), RemoteError> {
    let json: Value =
        serde_json::from_str(payload).map_err(|err| RemoteError::Malformed(err.to_string()))?;
    if let Some(error) = json.get("error") {
        let message = json
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("API error");
        return Err(RemoteError::Api {
            code: error.to_string(),
            message: message.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ScrobbleSummary {
    accepted: u32,
    ignored: u32,
    ignored_messages: Vec<String>,
}

fn summarize_scrobbles(payload: &str) -> Result<ScrobbleSummary, RemoteError> {
    let parsed: ScrobbleResponse =
        serde_json::from_str(payload).map_err(|err| RemoteError::Malformed(err.to_string()))?;
    let Some(scrobbles) = parsed.scrobbles else {
        return Err(RemoteError::Malformed(
            "missing scrobbles in response".to_string(),
        ));
    };
    let mut summary = ScrobbleSummary {
        accepted: scrobbles.attr.as_ref().map_or(0, |attr| attr.accepted),
        ignored: scrobbles.attr.as_ref().map_or(0, |attr| attr.ignored),
        ignored_messages: Vec::new(),
    };
    let entries = match scrobbles.scrobble {
        Some(ScrobbleEntries::One(entry)) => vec![entry],
        Some(ScrobbleEntries::Many(entries)) => entries,
        None => Vec::new(),
    };
    for entry in entries {
        if let Some(message) = entry.ignored_message.and_then(IgnoredMessageField::describe) {
            summary.ignored_messages.push(message);
        }
    }
    Ok(summary)
}

#[derive(Debug, Deserialize)]
struct ScrobbleResponse {
    #[serde(default)]
    scrobbles: Option<Scrobbles>,
}

#[derive(Debug, Deserialize)]
struct Scrobbles {
    #[serde(rename = "@attr")]
    #[serde(default)]
    attr: Option<ScrobbleAttr>,
    #[serde(default)]
    scrobble: Option<ScrobbleEntries>,
}

#[derive(Debug, Deserialize)]
struct ScrobbleAttr {
    #[serde(deserialize_with = "deserialize_u32_string_or_number")]
    accepted: u32,
    #[serde(deserialize_with = "deserialize_u32_string_or_number")]
    ignored: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScrobbleEntries {
    One(ScrobbleEntry),
    Many(Vec<ScrobbleEntry>),
}

#[derive(Debug, Deserialize)]
struct ScrobbleEntry {
    #[serde(rename = "ignoredMessage")]
    #[serde(default)]
    ignored_message: Option<IgnoredMessageField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IgnoredMessageField {
    Object(IgnoredMessage),
    Text(String),
    Number(u32),
}

impl IgnoredMessageField {
    /// Code "0" means the scrobble was not ignored.
    fn describe(self) -> Option<String> {
        match self {
            IgnoredMessageField::Object(message) => {
                let code = message.code.unwrap_or_else(|| "unknown".to_string());
                if code == "0" {
                    return None;
                }
                let text = message
                    .text
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| "Scrobble rejected".to_string());
                Some(format!("code {code}: {text}"))
            }
            IgnoredMessageField::Text(text) if text.is_empty() => None,
            IgnoredMessageField::Text(text) => Some(text),
            IgnoredMessageField::Number(0) => None,
            IgnoredMessageField::Number(code) => Some(format!("code {code}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IgnoredMessage {
    #[serde(rename = "#text")]
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn deserialize_u32_string_or_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrU32 {
        String(String),
        Number(u32),
    }
    match StringOrU32::deserialize(deserializer)? {
        StringOrU32::String(value) => value.parse::<u32>().map_err(serde::de::Error::custom),
        StringOrU32::Number(value) => Ok(value),
    }
}
