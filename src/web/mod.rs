// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP/SSE Gateway (C6): a hand-rolled route enum dispatched over
//! `hyper` 1.x, in the teacher's `web.rs` idiom rather than a framework —
//! the route surface here is no larger than the sample-file server's was.

mod query;
mod snapshot;
pub mod sse;

use crate::bus::Bus;
use crate::config::ConfigManager;
use crate::metrics::Metrics;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use futures::StreamExt;
use query::Query;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use store::{EventFilter, Presence, Severity, Store};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

pub struct GatewayConfig {
    pub static_dir: PathBuf,
    pub snapshot_allow_list: Vec<PathBuf>,
    pub snapshot_cache_max_age_secs: u64,
}

pub struct Gateway {
    pub bus: Arc<Bus>,
    pub store: Arc<Store>,
    pub metrics: Arc<Metrics>,
    pub config: GatewayConfig,
    /// Read for `video.channels` so list/single-event responses can attach
    /// `meta.resolvedChannels` (§3, §4.6) without the gateway keeping its own
    /// stale copy of the map across hot-config reloads.
    pub config_manager: Arc<ConfigManager>,
}

/// Computes the read-only derived fields §3 calls out as "never stored":
/// `snapshotUrl`/`faceSnapshotUrl`/`snapshotDiffUrl` and `resolvedChannels`.
/// Returns the event serialized to JSON with `meta` enriched in place.
pub(crate) fn enrich_event(
    event: &store::Event,
    channels: &std::collections::BTreeMap<String, Vec<String>>,
) -> serde_json::Value {
    let mut value = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
    let Some(meta) = value.get_mut("meta").and_then(|m| m.as_object_mut()) else {
        return value;
    };
    if event.meta.snapshot.is_some() {
        meta.insert(
            "snapshotUrl".to_string(),
            serde_json::Value::String(format!("/api/events/{}/snapshot", event.id)),
        );
        meta.insert(
            "snapshotDiffUrl".to_string(),
            serde_json::Value::String(format!("/api/events/{}/snapshot/diff", event.id)),
        );
    }
    if event.meta.face_snapshot.is_some() {
        meta.insert(
            "faceSnapshotUrl".to_string(),
            serde_json::Value::String(format!("/api/events/{}/face-snapshot", event.id)),
        );
    }
    let resolved = event
        .meta
        .channel
        .as_deref()
        .and_then(|ch| channels.get(ch))
        .cloned()
        .unwrap_or_default();
    meta.insert(
        "resolvedChannels".to_string(),
        serde_json::to_value(resolved).unwrap_or(serde_json::Value::Array(Vec::new())),
    );
    value
}

type Body = BoxBody<Bytes, Infallible>;

fn full_body(bytes: Vec<u8>) -> Body {
    Full::new(Bytes::from(bytes)).map_err(|never| match never {}).boxed()
}

fn empty_body() -> Body {
    Empty::new().map_err(|never| match never {}).boxed()
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(serde_json::to_vec(value).unwrap_or_default()))
        .unwrap()
}

fn not_found() -> Response<Body> {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({"error": "not found"}))
}

fn parse_query(req: &Request<Incoming>) -> Query {
    Query::parse(req.uri().query().unwrap_or(""))
}

fn parse_event_filter(q: &Query) -> EventFilter {
    let mut channels = q.get_all("channel").into_iter().map(str::to_string).collect::<Vec<_>>();
    channels.extend(q.get_csv("channels"));
    EventFilter {
        source: q.get("source").map(str::to_string),
        camera: q.get("camera").map(str::to_string),
        channels,
        detector: q.get("detector").map(str::to_string),
        severity: q.get("severity").and_then(Severity::parse),
        from_ts: q.get("from").and_then(parse_timestamp),
        to_ts: q.get("to").and_then(parse_timestamp),
        search: q.get("search").map(str::to_string),
        snapshot: parse_presence(q.get("snapshot")),
        face_snapshot: parse_presence(q.get("faceSnapshot")),
        min_id: None,
        limit: q
            .get("limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(EventFilter::DEFAULT_LIMIT)
            .clamp(1, EventFilter::MAX_LIMIT),
    }
}

fn parse_presence(v: Option<&str>) -> Option<Presence> {
    match v {
        Some("with") => Some(Presence::With),
        Some("without") => Some(Presence::Without),
        _ => None,
    }
}

/// Accepts either epoch milliseconds or an ISO-8601 timestamp (§6: `from`
/// may be either form).
fn parse_timestamp(v: &str) -> Option<i64> {
    if let Ok(ms) = v.parse::<i64>() {
        return Some(ms);
    }
    v.parse::<jiff::Timestamp>().ok().map(|t| t.as_millisecond())
}

impl Gateway {
    pub async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let response = match (method.clone(), path.as_str()) {
            (Method::GET, "/api/events") => self.list_events(&req, false),
            (Method::GET, "/api/events/snapshots") => self.list_events(&req, true),
            (Method::GET, "/api/events/stream") => self.stream_events(&req).await,
            (Method::GET, "/api/metrics/pipelines") => {
                json_response(StatusCode::OK, &self.metrics.snapshot(&[]))
            }
            (Method::GET, p) if p.starts_with("/api/faces") => self.faces_stub(),
            (Method::POST, p) if p.starts_with("/api/faces") => self.faces_stub(),
            (Method::DELETE, p) if p.starts_with("/api/faces") => self.faces_stub(),
            (Method::GET, p) if p.starts_with("/api/events/") => self.event_subroute(p, &req),
            (Method::GET | Method::HEAD, p) => self.static_asset(p, method == Method::HEAD),
            _ => not_found(),
        };
        Ok(response)
    }

    fn event_subroute(&self, path: &str, req: &Request<Incoming>) -> Response<Body> {
        let rest = &path["/api/events/".len()..];
        let (id_str, suffix) = match rest.split_once('/') {
            Some((id, suffix)) => (id, suffix),
            None => (rest, ""),
        };
        let Ok(id) = id_str.parse::<i64>() else { return not_found() };
        let Ok(Some(event)) = self.store.get(id) else { return not_found() };

        match suffix {
            "" => json_response(StatusCode::OK, &self.enrich(&event)),
            "snapshot" => self.serve_snapshot(event.meta.snapshot.as_deref(), req),
            "face-snapshot" => self.serve_snapshot(event.meta.face_snapshot.as_deref(), req),
            "snapshot/diff" => self.serve_snapshot_diff(&event),
            _ => not_found(),
        }
    }

    /// Serves a single snapshot file, honoring `If-None-Match`/
    /// `If-Modified-Since` conditional requests with a bodyless `304` per
    /// §4.6/§6.1.
    fn serve_snapshot(&self, raw_path: Option<&str>, req: &Request<Incoming>) -> Response<Body> {
        let Some(raw_path) = raw_path else { return not_found() };
        match snapshot::resolve(raw_path, &self.config.snapshot_allow_list) {
            snapshot::Resolved::NotFound => not_found(),
            snapshot::Resolved::Forbidden => json_response(
                StatusCode::FORBIDDEN,
                &serde_json::json!({"error": "snapshot path outside allow-listed roots"}),
            ),
            snapshot::Resolved::Ok(path) => {
                let Ok(meta) = snapshot::file_meta(&path) else { return not_found() };

                let none_match = req.headers().get("if-none-match").and_then(|v| v.to_str().ok());
                let if_modified = req.headers().get("if-modified-since").and_then(|v| v.to_str().ok());
                let cache_hit = none_match.is_some_and(|v| v == meta.etag)
                    || if_modified.is_some_and(|v| snapshot::not_modified_since(v, meta.modified));
                if cache_hit {
                    return Response::builder()
                        .status(StatusCode::NOT_MODIFIED)
                        .header("etag", meta.etag)
                        .header("last-modified", meta.last_modified_http)
                        .header(
                            "cache-control",
                            format!("public, max-age={}", self.config.snapshot_cache_max_age_secs),
                        )
                        .body(empty_body())
                        .unwrap();
                }

                let Ok(bytes) = std::fs::read(&path) else { return not_found() };
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "image/png")
                    .header(
                        "cache-control",
                        format!("public, max-age={}", self.config.snapshot_cache_max_age_secs),
                    )
                    .header("etag", meta.etag)
                    .header("last-modified", meta.last_modified_http)
                    .body(full_body(bytes))
                    .unwrap()
            }
        }
    }

    fn serve_snapshot_diff(&self, event: &store::Event) -> Response<Body> {
        let Some(current_raw) = event.meta.snapshot.as_deref() else { return not_found() };
        // The "baseline" is the most recent prior snapshot on the same
        // channel; callers needing a specific baseline pass it as
        // `meta.snapshot` on a different event id and diff client-side, so
        // here we diff against the immediately preceding event with a
        // snapshot on the same channel.
        let Some(channel) = event.meta.channel.clone() else { return not_found() };
        let filter = EventFilter {
            channels: vec![channel],
            snapshot: Some(Presence::With),
            limit: 2,
            ..Default::default()
        };
        let Ok(list) = self.store.list(&filter) else { return not_found() };
        let baseline_event = list.items.into_iter().find(|e| e.id != event.id);
        let Some(baseline_event) = baseline_event else { return not_found() };
        let Some(baseline_raw) = baseline_event.meta.snapshot.as_deref() else { return not_found() };

        let (current_resolved, baseline_resolved) = (
            snapshot::resolve(current_raw, &self.config.snapshot_allow_list),
            snapshot::resolve(baseline_raw, &self.config.snapshot_allow_list),
        );
        let (snapshot::Resolved::Ok(current_path), snapshot::Resolved::Ok(baseline_path)) =
            (current_resolved, baseline_resolved)
        else {
            return not_found();
        };

        match snapshot::diff_png(&baseline_path, &current_path) {
            Ok(png) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "image/png")
                .body(full_body(png))
                .unwrap(),
            Err(snapshot::DiffError::DimensionMismatch) => json_response(
                StatusCode::CONFLICT,
                &serde_json::json!({"error": "Snapshot dimensions do not match"}),
            ),
            Err(_) => not_found(),
        }
    }

    /// §4.6: "The gateway attaches snapshotUrl/faceSnapshotUrl/
    /// snapshotDiffUrl and resolvedChannels[] to each item's meta." These
    /// are derived on read and never stored (§3).
    fn enrich(&self, event: &store::Event) -> serde_json::Value {
        enrich_event(event, &self.config_manager.current().video.channels)
    }

    fn list_events(&self, req: &Request<Incoming>, snapshots_only: bool) -> Response<Body> {
        let q = parse_query(req);
        let mut filter = parse_event_filter(&q);
        if snapshots_only {
            filter.snapshot = Some(Presence::With);
        }
        match self.store.list(&filter) {
            Ok(result) => {
                let channels = self.config_manager.current().video.channels;
                let items: Vec<serde_json::Value> =
                    result.items.iter().map(|e| enrich_event(e, &channels)).collect();
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "items": items,
                        "total": result.total,
                        "summary": result.summary,
                        "metrics": self.metrics.snapshot(&["events"]),
                    }),
                )
            }
            Err(e) => {
                warn!(err = %e.chain(), "listing events failed");
                json_response(StatusCode::INTERNAL_SERVER_ERROR, &serde_json::json!({"error": "internal error"}))
            }
        }
    }

    async fn stream_events(self: &Arc<Self>, req: &Request<Incoming>) -> Response<Body> {
        let q = parse_query(req);
        let filter = sse::SseFilter::from_query(&q);
        let cfg = sse::ClientConfig::from_query(&q);
        let rx = sse::spawn(
            self.bus.clone(),
            self.store.clone(),
            self.metrics.clone(),
            self.config_manager.clone(),
            filter,
            cfg,
        );
        let stream = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(Bytes::from(chunk))));
        let body: Body = StreamBody::new(stream).boxed();
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive")
            .body(body)
            .unwrap()
    }

    fn faces_stub(&self) -> Response<Body> {
        json_response(
            StatusCode::NOT_IMPLEMENTED,
            &serde_json::json!({"error": "face registry not configured", "threshold": 0.6}),
        )
    }

    fn static_asset(&self, path: &str, head_only: bool) -> Response<Body> {
        let rel = if path == "/" { "index.html" } else { path.trim_start_matches('/') };
        let full_path = self.config.static_dir.join(rel);
        let Ok(canonical) = full_path.canonicalize() else { return not_found() };
        let Ok(static_dir_canonical) = self.config.static_dir.canonicalize() else {
            return not_found();
        };
        if !canonical.starts_with(&static_dir_canonical) {
            return not_found();
        }
        let Ok(bytes) = std::fs::read(&canonical) else { return not_found() };
        let content_type = content_type_for(&canonical);
        let body = if head_only { empty_body() } else { full_body(bytes) };
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type)
            .body(body)
            .unwrap()
    }

    /// Accepts connections on `addr` until `shutdown` fires, serving each
    /// one with [`Gateway::handle`]. Mirrors the teacher's hand-rolled
    /// accept loop, updated to hyper 1.x + `hyper-util`'s graceful-shutdown
    /// helper rather than the older `Server::bind(...).serve(...)` builder.
    pub async fn serve(
        self: Arc<Self>,
        addr: std::net::SocketAddr,
        shutdown: base::shutdown::Receiver,
    ) -> Result<(), base::Error> {
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;
        use hyper_util::server::graceful::GracefulShutdown;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, format!("binding {addr}"), e))?;
        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(%e, "accept failed");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let gateway = self.clone();
                    let conn = http1::Builder::new().serve_connection(
                        io,
                        service_fn(move |req| {
                            let gateway = gateway.clone();
                            async move { gateway.handle(req).await }
                        }),
                    );
                    let conn = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            warn!(%e, "connection error");
                        }
                    });
                }
                _ = shutdown.as_future() => break,
            }
        }
        graceful.shutdown().await;
        Ok(())
    }
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use store::{Event, Meta, Severity};

    fn event(meta: Meta) -> Event {
        Event { id: 7, ts: 0, source: "video:lobby".into(), detector: "motion".into(), severity: Severity::Info, message: "m".into(), meta }
    }

    #[test]
    fn enrich_adds_snapshot_urls_only_when_present() {
        let mut meta = Meta::default();
        meta.snapshot = Some("/var/snap/lobby/x.png".into());
        let v = enrich_event(&event(meta), &BTreeMap::new());
        assert_eq!(v["meta"]["snapshotUrl"], "/api/events/7/snapshot");
        assert_eq!(v["meta"]["snapshotDiffUrl"], "/api/events/7/snapshot/diff");
        assert!(v["meta"].get("faceSnapshotUrl").is_none());
    }

    #[test]
    fn enrich_resolves_channels_from_config_map() {
        let mut meta = Meta::default();
        meta.channel = Some("video:lobby".into());
        let mut channels = BTreeMap::new();
        channels.insert("video:lobby".to_string(), vec!["cam-1".to_string(), "cam-1-fallback".to_string()]);
        let v = enrich_event(&event(meta), &channels);
        assert_eq!(v["meta"]["resolvedChannels"], serde_json::json!(["cam-1", "cam-1-fallback"]));
    }

    #[test]
    fn enrich_defaults_resolved_channels_to_empty() {
        let v = enrich_event(&event(Meta::default()), &BTreeMap::new());
        assert_eq!(v["meta"]["resolvedChannels"], serde_json::json!([]));
    }

    #[test]
    fn content_type_matches_known_extensions() {
        assert_eq!(content_type_for(std::path::Path::new("a.svg")), "image/svg+xml");
        assert_eq!(content_type_for(std::path::Path::new("a.js")), "application/javascript");
        assert_eq!(content_type_for(std::path::Path::new("a.bin")), "application/octet-stream");
    }
}

