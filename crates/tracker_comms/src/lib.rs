mod tracker_comms;
pub mod tracker_comms_http;
pub mod tracker_comms_udp;

pub use tracker_comms::*;
