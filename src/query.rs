//! Aggregate range query protocol
//!
//! Request frames (subject `aggregated data`):
//! `uuid, GET|GET_TEST, asset, quantity, step, aggregation, start, end, ordered`
//!
//! Replies always start with the request uuid:
//! - `uuid, OK, asset, quantity, step, aggregation, start, end, ordered, units, [timestamp, value]*`
//! - `uuid, OK, <the 7 request fields>` for GET_TEST
//! - `uuid, ERROR, <reason>`

use crate::codec::parse_int64;
use crate::store::{RangeQuery, Rows, StoreConnector, StoredRow};
use std::str::FromStr;
use std::sync::Arc;

pub const AGGREGATE_SUBJECT: &str = "aggregated data";

const REQUEST_FIELDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    BadMessage,
    BadTimerange,
    BadRequest,
    BadOrdered,
    InternalError,
    UnsupportedSubject,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::BadMessage => "BAD_MESSAGE",
            ErrorReason::BadTimerange => "BAD_TIMERANGE",
            ErrorReason::BadRequest => "BAD_REQUEST",
            ErrorReason::BadOrdered => "BAD_ORDERED",
            ErrorReason::InternalError => "INTERNAL_ERROR",
            ErrorReason::UnsupportedSubject => "UNSUPPORTED_SUBJECT",
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to answer for a well-formed request on a topic the store never saw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownTopicPolicy {
    /// `ERROR, BAD_REQUEST`
    #[default]
    Reject,
    /// `OK` with empty units and no points
    Empty,
}

impl UnknownTopicPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnknownTopicPolicy::Reject => "reject",
            UnknownTopicPolicy::Empty => "empty",
        }
    }
}

impl FromStr for UnknownTopicPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(UnknownTopicPolicy::Reject),
            "empty" => Ok(UnknownTopicPolicy::Empty),
            other => Err(format!("unknown topic policy '{}' (expected reject|empty)", other)),
        }
    }
}

/// A validated request, keeping the caller's text for echoing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRequest {
    pub test: bool,
    pub asset: String,
    pub quantity: String,
    pub step: String,
    pub aggregation: String,
    pub start_text: String,
    pub end_text: String,
    pub ordered_text: String,
    pub start: i64,
    pub end: i64,
    pub ordered: bool,
}

impl AggregateRequest {
    /// Validate the frames that follow the uuid
    pub fn parse(fields: &[String]) -> Result<Self, ErrorReason> {
        if fields.len() != REQUEST_FIELDS {
            log::error!("Message has unsupported format ({} fields), ignore it", fields.len());
            return Err(ErrorReason::BadMessage);
        }

        let test = match fields[0].as_str() {
            "GET" => false,
            "GET_TEST" => true,
            other => {
                log::error!("GET command is missing (cmd: {})", other);
                return Err(ErrorReason::BadMessage);
            }
        };

        let (asset, quantity, step, aggregation) = (&fields[1], &fields[2], &fields[3], &fields[4]);
        if asset.is_empty() {
            log::error!("asset name is empty");
            return Err(ErrorReason::BadMessage);
        }
        if quantity.is_empty() {
            log::error!("quantity is empty");
            return Err(ErrorReason::BadMessage);
        }

        let start = parse_int64(&fields[5]).map_err(|e| {
            log::error!("start date cannot be converted to number: {}", e);
            ErrorReason::BadMessage
        })?;
        let end = parse_int64(&fields[6]).map_err(|e| {
            log::error!("end date cannot be converted to number: {}", e);
            ErrorReason::BadMessage
        })?;
        if start > end {
            log::error!("start date > end date ({} > {})", start, end);
            return Err(ErrorReason::BadTimerange);
        }

        let ordered = match fields[7].as_str() {
            "1" => true,
            "0" => false,
            other => {
                log::error!("ordered is not 1/0 ('{}')", other);
                return Err(ErrorReason::BadOrdered);
            }
        };

        Ok(Self {
            test,
            asset: asset.clone(),
            quantity: quantity.clone(),
            step: step.clone(),
            aggregation: aggregation.clone(),
            start_text: fields[5].clone(),
            end_text: fields[6].clone(),
            ordered_text: fields[7].clone(),
            start,
            end,
            ordered,
        })
    }

    /// Store topic `"<quantity>_<aggregation>_<step>@<asset>"`
    pub fn topic(&self) -> String {
        format!("{}_{}_{}@{}", self.quantity, self.aggregation, self.step, self.asset)
    }

    fn echo_fields(&self) -> [&str; 7] {
        [
            &self.asset,
            &self.quantity,
            &self.step,
            &self.aggregation,
            &self.start_text,
            &self.end_text,
            &self.ordered_text,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Echo(AggregateRequest),
    Series {
        request: AggregateRequest,
        units: String,
        points: Vec<(i64, f64)>,
    },
    Error(ErrorReason),
}

impl Reply {
    pub fn into_frames(self, uuid: &str) -> Vec<String> {
        let mut frames = vec![uuid.to_string()];
        match self {
            Reply::Echo(request) => {
                frames.push("OK".to_string());
                frames.extend(request.echo_fields().iter().map(|s| s.to_string()));
            }
            Reply::Series {
                request,
                units,
                points,
            } => {
                frames.reserve(9 + points.len() * 2);
                frames.push("OK".to_string());
                frames.extend(request.echo_fields().iter().map(|s| s.to_string()));
                frames.push(units);
                for (timestamp, value) in points {
                    frames.push(timestamp.to_string());
                    frames.push(value.to_string());
                }
            }
            Reply::Error(reason) => {
                frames.push("ERROR".to_string());
                frames.push(reason.as_str().to_string());
            }
        }
        frames
    }
}

/// Stateless request/reply handler; one store connection per request
pub struct QueryHandler {
    connector: Arc<dyn StoreConnector>,
    policy: UnknownTopicPolicy,
}

impl QueryHandler {
    pub fn new(connector: Arc<dyn StoreConnector>, policy: UnknownTopicPolicy) -> Self {
        Self { connector, policy }
    }

    /// Reply frames for one mailbox message, `None` when the message is empty
    pub fn handle(&self, subject: &str, frames: &[String]) -> Option<Vec<String>> {
        let Some((uuid, fields)) = frames.split_first() else {
            log::error!("Empty message with subject '{}', ignoring", subject);
            return None;
        };

        let reply = if subject == AGGREGATE_SUBJECT {
            self.process(fields)
        } else {
            log::error!("Bad subject '{}', ignoring", subject);
            Reply::Error(ErrorReason::UnsupportedSubject)
        };

        Some(reply.into_frames(uuid))
    }

    pub fn process(&self, fields: &[String]) -> Reply {
        let request = match AggregateRequest::parse(fields) {
            Ok(request) => request,
            Err(reason) => return Reply::Error(reason),
        };

        if request.test {
            log::trace!("test request for {}", request.topic());
            return Reply::Echo(request);
        }

        match self.fetch(request) {
            Ok(reply) => reply,
            Err(reason) => Reply::Error(reason),
        }
    }

    fn fetch(&self, request: AggregateRequest) -> Result<Reply, ErrorReason> {
        let topic = request.topic();

        let store = self.connector.connect().map_err(|e| {
            log::error!("❌ Can't connect to the database: {}", e);
            ErrorReason::InternalError
        })?;

        let info = store.lookup_topic(&topic).map_err(|e| {
            log::error!("unexpected error during topic selection ({}): {}", topic, e);
            ErrorReason::InternalError
        })?;

        let Some(info) = info else {
            log::error!("topic is not found ({})", topic);
            return match self.policy {
                UnknownTopicPolicy::Reject => Err(ErrorReason::BadRequest),
                UnknownTopicPolicy::Empty => Ok(Reply::Series {
                    request,
                    units: String::new(),
                    points: Vec::new(),
                }),
            };
        };
        log::debug!("select topic '{}' -> id {} units '{}'", topic, info.topic_id, info.units);

        let query = RangeQuery {
            topic_id: info.topic_id,
            start: request.start,
            end: request.end,
            ordered: request.ordered,
        };

        // Partial results are discarded on the first storage error
        let points = Rows::new(store.as_ref(), query)
            .map(|row| row.map(|r: StoredRow| r.to_point()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                log::error!("unexpected error during measurement selecting: {}", e);
                ErrorReason::InternalError
            })?;

        Ok(Reply::Series {
            request,
            units: info.units,
            points,
        })
    }
}
