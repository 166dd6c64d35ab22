//! Framework metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted across all loops"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently open connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "bytes_received",
    description = "Total bytes read from connections"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "bytes_sent",
    description = "Total bytes written to connections"
)]
pub static BYTES_SENT: Counter = Counter::new();
