//! Timestamped samples and their distribution to clients.
//!
//! A [`Sample`] is either a raw message as framed from a sensor's byte stream,
//! or the floating-point result of scanning such a message. Samples are shared
//! as [`SampleRef`] (`Arc<Sample>`): every client that wants to keep a sample
//! clones the handle, and the payload is freed when the last handle drops.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;

/// Time tag in microseconds since the Unix epoch.
pub type Timetag = i64;

/// Microseconds per second.
pub const USECS_PER_SEC: i64 = 1_000_000;

/// Microseconds per millisecond.
pub const USECS_PER_MSEC: i64 = 1_000;

/// Current system time as a [`Timetag`].
#[must_use]
pub fn now_usecs() -> Timetag {
    chrono::Utc::now().timestamp_micros()
}

/// Payload of a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleData {
    /// Unparsed bytes of one framed message.
    Raw(Bytes),
    /// Scanned and converted values, one slot per variable.
    Values(Vec<f64>),
}

/// One timestamped unit of data.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Sensor id for raw samples, sample tag id for processed samples.
    pub id: u32,
    /// Time tag.
    pub time: Timetag,
    /// Payload.
    pub data: SampleData,
}

/// Shared, reference-counted sample handle.
pub type SampleRef = Arc<Sample>;

impl Sample {
    /// Build a raw sample.
    pub fn raw(id: u32, time: Timetag, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            time,
            data: SampleData::Raw(data.into()),
        }
    }

    /// Build a processed sample.
    pub fn values(id: u32, time: Timetag, values: Vec<f64>) -> Self {
        Self {
            id,
            time,
            data: SampleData::Values(values),
        }
    }

    /// Raw bytes, if this is a raw sample.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            SampleData::Raw(b) => Some(b),
            SampleData::Values(_) => None,
        }
    }

    /// Values, if this is a processed sample.
    #[must_use]
    pub fn as_values(&self) -> Option<&[f64]> {
        match &self.data {
            SampleData::Values(v) => Some(v),
            SampleData::Raw(_) => None,
        }
    }

    /// Number of payload elements (bytes or values).
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.data {
            SampleData::Raw(b) => b.len(),
            SampleData::Values(v) => v.len(),
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiver of samples.
///
/// `receive` is invoked synchronously on the thread producing the sample
/// (the reactor), so implementations must not block.
pub trait SampleClient: Send + Sync {
    /// Handle one sample. Clone the handle to keep it.
    fn receive(&self, sample: &SampleRef);
}

/// A list of sample clients.
#[derive(Default)]
pub struct SampleSource {
    clients: RwLock<Vec<Arc<dyn SampleClient>>>,
}

impl std::fmt::Debug for SampleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleSource")
            .field("clients", &self.clients.read().len())
            .finish()
    }
}

fn same_client(a: &Arc<dyn SampleClient>, b: &Arc<dyn SampleClient>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl SampleSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client. Adding the same client twice has no effect.
    pub fn add_client(&self, client: Arc<dyn SampleClient>) {
        let mut clients = self.clients.write();
        if !clients.iter().any(|c| same_client(c, &client)) {
            clients.push(client);
        }
    }

    /// Remove a client, returning whether it was present.
    pub fn remove_client(&self, client: &Arc<dyn SampleClient>) -> bool {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|c| !same_client(c, client));
        clients.len() != before
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Hand a sample to every client.
    pub fn distribute(&self, sample: &SampleRef) {
        // Snapshot so a client may add/remove clients from within receive().
        let clients: Vec<Arc<dyn SampleClient>> = self.clients.read().clone();
        for client in &clients {
            client.receive(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector {
        samples: Mutex<Vec<SampleRef>>,
    }

    impl SampleClient for Collector {
        fn receive(&self, sample: &SampleRef) {
            self.samples.lock().push(Arc::clone(sample));
        }
    }

    #[test]
    fn test_distribute_and_remove() {
        let source = SampleSource::new();
        let collector = Arc::new(Collector::default());
        let client: Arc<dyn SampleClient> = collector.clone();

        source.add_client(client.clone());
        source.add_client(client.clone());
        assert_eq!(source.client_count(), 1);

        let sample: SampleRef = Arc::new(Sample::raw(1, 10, &b"abc"[..]));
        source.distribute(&sample);
        assert_eq!(collector.samples.lock().len(), 1);
        // The collector holds a second reference.
        assert_eq!(Arc::strong_count(&sample), 2);

        assert!(source.remove_client(&client));
        assert!(!source.remove_client(&client));
        source.distribute(&sample);
        assert_eq!(collector.samples.lock().len(), 1);
    }

    #[test]
    fn test_payload_accessors() {
        let raw = Sample::raw(3, 0, &b"1.5\n"[..]);
        assert_eq!(raw.as_bytes(), Some(&b"1.5\n"[..]));
        assert!(raw.as_values().is_none());
        assert_eq!(raw.len(), 4);

        let vals = Sample::values(4, 0, vec![1.0, f64::NAN]);
        assert_eq!(vals.len(), 2);
        assert!(vals.as_bytes().is_none());
    }
}
