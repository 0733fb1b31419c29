//! Probe round results and the static field table.
//!
//! Every field of [`Stats`] is described once in [`FIELDS`]: its display name
//! (used by the text/JSON output and the `--filter` flag), its metric name,
//! its help text and whether it is exported. The metrics exporter and the
//! output formatters both iterate this table instead of the struct itself.

use crate::probe::KernelStats;

/// Result of one probe round against a single target.
///
/// Timings are in microseconds. `tcp_connect_error`, `dns_resolve_error` and
/// `connect_attempts` accumulate over the lifetime of a client; everything
/// else is overwritten by each round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    /// 1 when every stage of the round completed, 0 otherwise.
    pub state: u8,
    pub kernel: KernelStats,
    pub http_status_code: u16,
    pub http_rcvd_bytes: i64,
    pub http_request: i64,
    pub http_response: i64,
    pub dns_resolve: i64,
    pub tcp_connect: i64,
    pub tls_handshake: i64,
    pub tcp_connect_error: i64,
    pub dns_resolve_error: i64,
    pub connect_attempts: i64,
}

impl Stats {
    /// Clear the point-in-time fields ahead of a new round.
    pub fn begin_round(&mut self) {
        *self = Self {
            tcp_connect_error: self.tcp_connect_error,
            dns_resolve_error: self.dns_resolve_error,
            connect_attempts: self.connect_attempts,
            ..Self::default()
        };
    }
}

/// Static description of one [`Stats`] field.
#[derive(Debug)]
pub struct Field {
    /// Display name, e.g. `HTTPStatusCode`.
    pub name: &'static str,
    /// Metric name without the `tcptrail_` prefix.
    pub metric: &'static str,
    pub help: &'static str,
    /// Unexported fields never reach the metrics registry or default output.
    pub exported: bool,
    pub get: fn(&Stats) -> i64,
}

impl Field {
    pub fn value(&self, stats: &Stats) -> i64 {
        (self.get)(stats)
    }
}

macro_rules! field {
    ($name:literal, $metric:literal, $help:literal, |$s:ident| $get:expr) => {
        Field { name: $name, metric: $metric, help: $help, exported: true, get: |$s| $get }
    };
    ($name:literal, $metric:literal, $help:literal, |$s:ident| $get:expr, internal) => {
        Field { name: $name, metric: $metric, help: $help, exported: false, get: |$s| $get }
    };
}

pub static FIELDS: &[Field] = &[
    field!("State", "state", "probe state, 1 when the round succeeded", |s| s.state as i64),
    field!("CaState", "ca_state", "state of congestion avoidance", |s| s.kernel.ca_state as i64),
    field!("Retransmits", "retransmits", "number of retransmissions on timeout invoked", |s| s.kernel.retransmits as i64),
    field!("Probes", "probes", "consecutive zero window probes that have gone unanswered", |s| s.kernel.probes as i64),
    field!("Backoff", "backoff", "exponential backoff re-transmission counter", |s| s.kernel.backoff as i64),
    field!("Options", "options", "negotiated TCP options bitmask", |s| s.kernel.options as i64),
    field!("Rto", "rto", "retransmission timeout in microseconds", |s| s.kernel.rto as i64),
    field!("Ato", "ato", "delayed ack timeout in microseconds", |s| s.kernel.ato as i64),
    field!("SndMss", "snd_mss", "current maximum segment size", |s| s.kernel.snd_mss as i64),
    field!("RcvMss", "rcv_mss", "maximum observed segment size from the remote host", |s| s.kernel.rcv_mss as i64),
    field!("Unacked", "unacked", "number of unacknowledged segments", |s| s.kernel.unacked as i64),
    field!("Sacked", "sacked", "segments marked SACKed by sack blocks", |s| s.kernel.sacked as i64),
    field!("Lost", "lost", "segments marked lost by loss detection heuristics", |s| s.kernel.lost as i64),
    field!("Retrans", "retrans", "segments currently being retransmitted", |s| s.kernel.retrans as i64),
    field!("Fackets", "fackets", "forward acknowledged segments", |s| s.kernel.fackets as i64, internal),
    field!("LastDataSent", "last_data_sent", "milliseconds since the last data segment was sent", |s| s.kernel.last_data_sent as i64),
    field!("LastAckSent", "last_ack_sent", "milliseconds since the last ack was sent", |s| s.kernel.last_ack_sent as i64),
    field!("LastDataRecv", "last_data_recv", "milliseconds since the last data segment was received", |s| s.kernel.last_data_recv as i64),
    field!("LastAckRecv", "last_ack_recv", "milliseconds since the last ack was received", |s| s.kernel.last_ack_recv as i64),
    field!("Pmtu", "path_mtu", "path MTU", |s| s.kernel.pmtu as i64),
    field!("RcvSsthresh", "rcv_ss_thresh", "receive slow start threshold", |s| s.kernel.rcv_ssthresh as i64),
    field!("Rtt", "rtt", "smoothed round trip time in microseconds", |s| s.kernel.rtt as i64),
    field!("Rttvar", "rtt_var", "round trip time variance in microseconds", |s| s.kernel.rttvar as i64),
    field!("SndSsthresh", "snd_ss_thresh", "send slow start threshold", |s| s.kernel.snd_ssthresh as i64),
    field!("SndCwnd", "snd_cwnd", "congestion window size in segments", |s| s.kernel.snd_cwnd as i64),
    field!("Advmss", "adv_mss", "advertised maximum segment size", |s| s.kernel.advmss as i64),
    field!("Reordering", "reordering", "reordering metric", |s| s.kernel.reordering as i64),
    field!("RcvRtt", "rcv_rtt", "receiver side round trip time estimate in microseconds", |s| s.kernel.rcv_rtt as i64),
    field!("RcvSpace", "rcv_space", "receive buffer space", |s| s.kernel.rcv_space as i64),
    field!("TotalRetrans", "total_retrans", "total retransmitted segments on the connection", |s| s.kernel.total_retrans as i64),
    field!("HTTPStatusCode", "http_status_code", "HTTP 1xx-5xx status code", |s| s.http_status_code as i64),
    field!("HTTPRcvdBytes", "http_rcvd_bytes", "HTTP response body bytes received", |s| s.http_rcvd_bytes),
    field!("HTTPRequest", "http_request", "request sent to response head, in microseconds", |s| s.http_request),
    field!("HTTPResponse", "http_response", "response head to body fully read, in microseconds", |s| s.http_response),
    field!("DNSResolve", "dns_resolve", "domain lookup duration in microseconds", |s| s.dns_resolve),
    field!("TCPConnect", "tcp_connect", "TCP connect duration in microseconds", |s| s.tcp_connect),
    field!("TLSHandshake", "tls_handshake", "TLS handshake duration in microseconds", |s| s.tls_handshake),
    field!("TCPConnectError", "tcp_connect_error", "total TCP connect errors", |s| s.tcp_connect_error),
    field!("DNSResolveError", "dns_resolve_error", "total DNS resolve errors", |s| s.dns_resolve_error),
    field!("ConnectAttempts", "connect_attempts", "total connect attempts", |s| s.connect_attempts, internal),
];

/// Iterate the exported fields in table order.
pub fn exported_fields() -> impl Iterator<Item = &'static Field> {
    FIELDS.iter().filter(|f| f.exported)
}

/// A case-insensitive selection of field display names.
///
/// An empty filter selects every exported field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldFilter {
    names: Vec<String>,
}

impl FieldFilter {
    /// Parse a comma separated list such as `"rtt,HTTPStatusCode"`.
    pub fn parse(list: &str) -> Self {
        let names = list
            .split(',')
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Self { names }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Fields selected by this filter, in table order.
    pub fn fields(&self) -> impl Iterator<Item = &'static Field> + '_ {
        exported_fields().filter(move |f| {
            self.names.is_empty() || self.names.iter().any(|n| f.name.eq_ignore_ascii_case(n))
        })
    }
}
