use std::fmt::Write as _;

use anyhow::{Context, Result};

use super::{DeliveryError, PointWriter};
use crate::batch::Batch;
use crate::config::{DatabaseConfig, DbApi};

enum Auth {
    None,
    Basic { user: String, password: String },
    Token(String),
}

/// InfluxDB line-protocol writer over HTTP (1.x or 2.x write API).
pub struct InfluxWriter {
    http: reqwest::Client,
    url: String,
    query: Vec<(&'static str, String)>,
    auth: Auth,
    measurement: String,
}

impl InfluxWriter {
    pub fn new(cfg: &DatabaseConfig) -> Result<Self> {
        // The deliverer enforces the per-attempt timeout; this one only
        // bounds connection setup.
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        let scheme = if cfg.tls { "https" } else { "http" };
        let base = format!("{scheme}://{}:{}", cfg.host, cfg.port);

        let (url, query, auth) = match cfg.api {
            DbApi::V1 => {
                let auth = match cfg.credentials.split_once(':') {
                    Some((user, password)) => Auth::Basic {
                        user: user.to_string(),
                        password: password.to_string(),
                    },
                    None if cfg.credentials.is_empty() => Auth::None,
                    None => Auth::Basic {
                        user: cfg.credentials.clone(),
                        password: String::new(),
                    },
                };
                (
                    format!("{base}/write"),
                    vec![
                        ("db", cfg.database_or_bucket.clone()),
                        ("precision", "s".to_string()),
                    ],
                    auth,
                )
            }
            DbApi::V2 => {
                let auth = if cfg.credentials.is_empty() {
                    Auth::None
                } else {
                    Auth::Token(cfg.credentials.clone())
                };
                (
                    format!("{base}/api/v2/write"),
                    vec![
                        ("org", cfg.org.clone()),
                        ("bucket", cfg.database_or_bucket.clone()),
                        ("precision", "s".to_string()),
                    ],
                    auth,
                )
            }
        };

        Ok(Self {
            http,
            url,
            query,
            auth,
            measurement: cfg.measurement.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PointWriter for InfluxWriter {
    async fn write(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let body = encode_line(&self.measurement, batch);

        let mut request = self
            .http
            .post(&self.url)
            .query(&self.query)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);

        request = match &self.auth {
            Auth::None => request,
            Auth::Basic { user, password } => request.basic_auth(user, Some(password)),
            Auth::Token(token) => request.header("Authorization", format!("Token {token}")),
        };

        let resp = request.send().await.map_err(classify)?;
        let status = resp.status();

        if status.is_success() {
            // Drain body for connection reuse.
            let _ = resp.bytes().await;
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(DeliveryError::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

fn classify(e: reqwest::Error) -> DeliveryError {
    if e.is_connect() {
        DeliveryError::Connect(e.to_string())
    } else {
        DeliveryError::Request(e.to_string())
    }
}

/// Encode a batch as one line-protocol point with second precision.
pub fn encode_line(measurement: &str, batch: &Batch) -> String {
    let mut line = String::with_capacity(64 + batch.len() * 24);

    escape_into(&mut line, measurement, &[',', ' ']);
    line.push_str(",host=");
    escape_into(&mut line, &batch.host_tag, &[',', '=', ' ']);
    line.push(' ');

    for (i, (metric, value)) in batch.fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        // Field keys are fixed identifiers without special characters.
        let _ = write!(line, "{}={}", metric.as_str(), value);
    }

    let _ = write!(line, " {}", batch.timestamp.timestamp());
    line
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use super::*;
    use crate::metric::Metric;

    fn batch(host: &str) -> Batch {
        Batch {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            host_tag: host.to_string(),
            fields: BTreeMap::from([
                (Metric::Temperature, 21.46),
                (Metric::Humidity, 40.0),
                (Metric::Pm2_5, 3.5),
            ]),
        }
    }

    #[derive(Default)]
    struct Captured {
        query: HashMap<String, String>,
        auth: Option<String>,
        body: String,
    }

    async fn capture_server(status: StatusCode) -> (String, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));

        async fn handler(
            State((captured, status)): State<(Arc<Mutex<Captured>>, StatusCode)>,
            Query(query): Query<HashMap<String, String>>,
            headers: HeaderMap,
            body: String,
        ) -> (StatusCode, &'static str) {
            let mut c = captured.lock();
            c.query = query;
            c.auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            c.body = body;
            (status, "partial write: field type conflict")
        }

        let app = Router::new()
            .route("/write", post(handler))
            .route("/api/v2/write", post(handler))
            .with_state((Arc::clone(&captured), status));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (port, captured)
    }

    fn db(port: &str, api: DbApi, credentials: &str) -> DatabaseConfig {
        DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: port.parse().unwrap(),
            api,
            credentials: credentials.to_string(),
            org: "home".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_line_fields_and_timestamp() {
        let line = encode_line("environment", &batch("raspberry-pi"));
        assert_eq!(
            line,
            "environment,host=raspberry-pi temperature=21.46,humidity=40,pm2_5=3.5 1714564800"
        );
    }

    #[test]
    fn test_encode_line_escapes_tag_value() {
        let line = encode_line("env room", &batch("living room,1=a"));
        assert!(line.starts_with("env\\ room,host=living\\ room\\,1\\=a "));
    }

    #[tokio::test]
    async fn test_v1_write_uses_db_and_basic_auth() {
        let (port, captured) = capture_server(StatusCode::NO_CONTENT).await;
        let writer = InfluxWriter::new(&db(&port, DbApi::V1, "logger:secret")).unwrap();

        writer.write(&batch("pi")).await.unwrap();

        let c = captured.lock();
        assert_eq!(c.query.get("db").map(String::as_str), Some("sensors"));
        assert_eq!(c.query.get("precision").map(String::as_str), Some("s"));
        assert!(c.auth.as_deref().unwrap_or_default().starts_with("Basic "));
        assert!(c.body.starts_with("environment,host=pi "));
    }

    #[tokio::test]
    async fn test_v2_write_uses_bucket_and_token() {
        let (port, captured) = capture_server(StatusCode::NO_CONTENT).await;
        let writer = InfluxWriter::new(&db(&port, DbApi::V2, "tok3n")).unwrap();

        writer.write(&batch("pi")).await.unwrap();

        let c = captured.lock();
        assert_eq!(c.query.get("bucket").map(String::as_str), Some("sensors"));
        assert_eq!(c.query.get("org").map(String::as_str), Some("home"));
        assert_eq!(c.auth.as_deref(), Some("Token tok3n"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (port, _captured) = capture_server(StatusCode::BAD_REQUEST).await;
        let writer = InfluxWriter::new(&db(&port, DbApi::V1, "")).unwrap();

        let err = writer.write(&batch("pi")).await.unwrap_err();
        match err {
            DeliveryError::Status { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("field type conflict"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);

        let writer = InfluxWriter::new(&db(&port, DbApi::V1, "")).unwrap();
        let err = writer.write(&batch("pi")).await.unwrap_err();
        assert_eq!(err.kind(), "connect");
    }
}
