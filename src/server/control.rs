//! Control commands delivered to the agent by its owner
//!
//! Frames: `$TERM` | `CONNECT/endpoint/name` | `PRODUCER/stream` |
//! `CONSUMER/stream/pattern` | `CONFIGURE/path`

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Term,
    Connect { endpoint: String, name: String },
    Producer { stream: String },
    Consumer { stream: String, pattern: String },
    Configure { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// No frames at all
    Empty,
    /// Known command with missing arguments
    Malformed { command: String, expected: &'static str },
    Unknown(String),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Empty => write!(f, "Empty control message"),
            ControlError::Malformed { command, expected } => {
                write!(f, "Malformed {} command, expected {}", command, expected)
            }
            ControlError::Unknown(cmd) => write!(f, "Command '{}' is unknown or not implemented", cmd),
        }
    }
}

impl std::error::Error for ControlError {}

impl ControlCommand {
    pub fn parse(frames: &[String]) -> Result<Self, ControlError> {
        let Some((cmd, args)) = frames.split_first() else {
            return Err(ControlError::Empty);
        };

        let malformed = |expected: &'static str| ControlError::Malformed {
            command: cmd.clone(),
            expected,
        };

        match cmd.as_str() {
            "$TERM" => Ok(ControlCommand::Term),
            "CONNECT" => match args {
                [endpoint, name, ..] => Ok(ControlCommand::Connect {
                    endpoint: endpoint.clone(),
                    name: name.clone(),
                }),
                _ => Err(malformed("CONNECT/endpoint/name")),
            },
            "PRODUCER" => match args {
                [stream, ..] => Ok(ControlCommand::Producer {
                    stream: stream.clone(),
                }),
                _ => Err(malformed("PRODUCER/stream")),
            },
            "CONSUMER" => match args {
                [stream, pattern, ..] => Ok(ControlCommand::Consumer {
                    stream: stream.clone(),
                    pattern: pattern.clone(),
                }),
                _ => Err(malformed("CONSUMER/stream/pattern")),
            },
            "CONFIGURE" => match args {
                [path, ..] => Ok(ControlCommand::Configure { path: path.clone() }),
                _ => Err(malformed("CONFIGURE/config_file")),
            },
            "" => Err(ControlError::Empty),
            other => Err(ControlError::Unknown(other.to_string())),
        }
    }

    /// Frames that `parse` turns back into this command
    pub fn to_frames(&self) -> Vec<String> {
        let parts: Vec<&str> = match self {
            ControlCommand::Term => vec!["$TERM"],
            ControlCommand::Connect { endpoint, name } => vec!["CONNECT", endpoint.as_str(), name.as_str()],
            ControlCommand::Producer { stream } => vec!["PRODUCER", stream.as_str()],
            ControlCommand::Consumer { stream, pattern } => vec!["CONSUMER", stream.as_str(), pattern.as_str()],
            ControlCommand::Configure { path } => vec!["CONFIGURE", path.as_str()],
        };
        parts.into_iter().map(String::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ControlCommand::parse(&frames(&["$TERM"])).unwrap(), ControlCommand::Term);
        assert_eq!(
            ControlCommand::parse(&frames(&["CONNECT", "ipc://@/malamute", "fty-metric-store"])).unwrap(),
            ControlCommand::Connect {
                endpoint: "ipc://@/malamute".to_string(),
                name: "fty-metric-store".to_string(),
            }
        );
        assert_eq!(
            ControlCommand::parse(&frames(&["CONSUMER", "ASSETS", ".*"])).unwrap(),
            ControlCommand::Consumer {
                stream: "ASSETS".to_string(),
                pattern: ".*".to_string(),
            }
        );
        assert_eq!(
            ControlCommand::parse(&frames(&["PRODUCER", "METRICS"])).unwrap(),
            ControlCommand::Producer {
                stream: "METRICS".to_string()
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ControlCommand::parse(&[]), Err(ControlError::Empty));
        assert_eq!(ControlCommand::parse(&frames(&[""])), Err(ControlError::Empty));
        assert!(matches!(
            ControlCommand::parse(&frames(&["CONNECT", "ipc://@/malamute"])),
            Err(ControlError::Malformed { .. })
        ));
        assert!(matches!(
            ControlCommand::parse(&frames(&["CONSUMER"])),
            Err(ControlError::Malformed { .. })
        ));
        assert_eq!(
            ControlCommand::parse(&frames(&["REBOOT"])),
            Err(ControlError::Unknown("REBOOT".to_string()))
        );
    }

    #[test]
    fn test_frames_parse_back() {
        let command = ControlCommand::Consumer {
            stream: "METRICS".to_string(),
            pattern: ".*".to_string(),
        };
        assert_eq!(ControlCommand::parse(&command.to_frames()).unwrap(), command);
    }
}
