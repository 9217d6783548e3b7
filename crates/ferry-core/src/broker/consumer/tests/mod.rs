use super::*;
use crate::broker::ack::InvocationOutcome;
use crate::broker::metrics::test_harness::MetricTestHarness;
use crate::broker::{Broker, FerryConfig};
use crate::clock::Clock;
use crate::message::MessageId;
use crate::store::MemoryStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

mod common;
use common::*;

mod delivery;
