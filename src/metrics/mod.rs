//! Utils to record metrics.
//!
//! The coordinator only emits measurements. Where they end up is decided by whoever installs the
//! global [`Recorder`]: it forwards every [`Metric`] and [`Event`] to the receiving half of an
//! unbounded channel. Nothing is recorded unless a recorder is installed.

use std::time::SystemTime;

use derive_more::Display;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;

static RECORDER: OnceCell<Recorder> = OnceCell::new();

/// The measurements the coordinator emits.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    #[display(fmt = "round_total_number")]
    RoundTotalNumber,
    #[display(fmt = "phase")]
    Phase,
    #[display(fmt = "phase_duration")]
    PhaseDuration,
    #[display(fmt = "cohort_size")]
    CohortSize,
    #[display(fmt = "dropouts")]
    Dropouts,
    #[display(fmt = "message_accepted")]
    MessageAccepted,
    #[display(fmt = "message_rejected")]
    MessageRejected,
    #[display(fmt = "message_discarded")]
    MessageDiscarded,
    #[display(fmt = "aggregation_success")]
    AggregationSuccess,
    #[display(fmt = "aggregation_failure")]
    AggregationFailure,
}

/// Key/value pairs attached to a metric.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tag.
    pub fn add(&mut self, tag: impl ToString, value: impl ToString) {
        self.0.push((tag.to_string(), value.to_string()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

/// A single recorded value.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub measurement: Measurement,
    pub value: f64,
    pub tags: Tags,
    pub time: SystemTime,
}

/// A single recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub title: String,
    pub description: Option<String>,
    pub time: SystemTime,
}

/// Anything a [`Recorder`] forwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Metric(Metric),
    Event(Event),
}

/// Forwards records to a channel.
#[derive(Debug, Clone)]
pub struct Recorder(mpsc::UnboundedSender<Record>);

impl Recorder {
    /// Creates a recorder and the receiver of its records.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Records a metric.
    pub fn metric(&self, measurement: Measurement, value: impl Into<f64>, tags: Option<Tags>) {
        let metric = Metric {
            measurement,
            value: value.into(),
            tags: tags.unwrap_or_default(),
            time: SystemTime::now(),
        };
        // a closed receiver only means nobody listens anymore
        let _ = self.0.send(Record::Metric(metric));
    }

    /// Records an event.
    pub fn event(&self, title: impl ToString, description: Option<String>) {
        let event = Event {
            title: title.to_string(),
            description,
            time: SystemTime::now(),
        };
        let _ = self.0.send(Record::Event(event));
    }
}

/// A wrapper around a static global metrics/events recorder.
pub struct GlobalRecorder;

impl GlobalRecorder {
    /// Gets the reference to the global recorder.
    ///
    /// Returns `None` if no recorder is set or is currently being initialized.
    /// This method never blocks.
    pub fn global() -> Option<&'static Recorder> {
        RECORDER.get()
    }

    /// Installs a new global recorder.
    ///
    /// Returns Err(Recorder) if a recorder has already been set.
    pub fn install(recorder: Recorder) -> Result<(), Recorder> {
        RECORDER.set(recorder)
    }
}

/// Records an event.
///
/// # Example
///
/// ```ignore
/// event!("Round failed");
/// event!("Round failed", "too few dropout shares");
/// ```
#[macro_export]
macro_rules! event {
    ($title: expr $(,)?) => {
        if let Some(recorder) = $crate::metrics::GlobalRecorder::global() {
            recorder.event($title, None);
        }
    };
    ($title: expr, $description: expr $(,)?) => {
        if let Some(recorder) = $crate::metrics::GlobalRecorder::global() {
            recorder.event($title, Some($description.to_string()));
        }
    };
}

/// Records a metric.
///
/// # Example
///
/// ```ignore
/// metric!(Measurement::RoundTotalNumber, 1);
/// metric!(Measurement::CohortSize, 4, ("round_id", 1));
/// metric!(accepted: round_id, PhaseName::Collecting);
/// ```
#[macro_export]
macro_rules! metric {
    (accepted: $round_id: expr, $phase: expr $(,)?) => {
        $crate::metric!(
            $crate::metrics::Measurement::MessageAccepted,
            1_u32,
            ("round_id", $round_id),
            ("phase", $phase),
        );
    };
    (rejected: $round_id: expr, $phase: expr $(,)?) => {
        $crate::metric!(
            $crate::metrics::Measurement::MessageRejected,
            1_u32,
            ("round_id", $round_id),
            ("phase", $phase),
        );
    };
    (discarded: $round_id: expr, $phase: expr $(,)?) => {
        $crate::metric!(
            $crate::metrics::Measurement::MessageDiscarded,
            1_u32,
            ("round_id", $round_id),
            ("phase", $phase),
        );
    };
    ($measurement: expr, $value: expr $(,)?) => {
        if let Some(recorder) = $crate::metrics::GlobalRecorder::global() {
            recorder.metric($measurement, $value, None);
        }
    };
    ($measurement: expr, $value: expr, $(($tag: expr, $val: expr)),+ $(,)?) => {
        if let Some(recorder) = $crate::metrics::GlobalRecorder::global() {
            let mut tags = $crate::metrics::Tags::new();
            $(
                tags.add($tag, $val);
            )+
            recorder.metric($measurement, $value, Some(tags));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_forwards_records() {
        let (recorder, mut rx) = Recorder::new();
        let mut tags = Tags::new();
        tags.add("round_id", 3);
        recorder.metric(Measurement::CohortSize, 4_u32, Some(tags.clone()));
        recorder.event("Round failed", Some("too few shares".into()));

        match rx.try_recv().unwrap() {
            Record::Metric(metric) => {
                assert_eq!(metric.measurement, Measurement::CohortSize);
                assert_eq!(metric.value, 4.);
                assert_eq!(metric.tags, tags);
            }
            record => panic!("unexpected record {:?}", record),
        }
        match rx.try_recv().unwrap() {
            Record::Event(event) => {
                assert_eq!(event.title, "Round failed");
                assert_eq!(event.description.as_deref(), Some("too few shares"));
            }
            record => panic!("unexpected record {:?}", record),
        }
    }

    #[test]
    fn test_measurement_names() {
        assert_eq!(Measurement::PhaseDuration.to_string(), "phase_duration");
        assert_eq!(Measurement::MessageDiscarded.to_string(), "message_discarded");
    }
}
