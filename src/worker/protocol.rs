//! Message protocol between the recognition host and its worker thread.

use serde::{Deserialize, Serialize};

use crate::vision::{RecognitionRequest, RecognitionToken};

/// Requests sent by the host to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Load models and resolve endpoints
    Init { id: u64 },
    /// Run a throwaway inference on every ready engine
    Warmup { id: u64 },
    /// Recognize one image
    Recognize { id: u64, payload: RecognitionRequest },
    /// Answer, then stop the worker loop
    Destroy { id: u64 },
}

impl WorkerRequest {
    /// Correlation id
    pub fn id(&self) -> u64 {
        match self {
            WorkerRequest::Init { id }
            | WorkerRequest::Warmup { id }
            | WorkerRequest::Recognize { id, .. }
            | WorkerRequest::Destroy { id } => *id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Per-engine-family output of one request, fused on the host side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOutputs {
    /// Text engine tokens, or remote tokens when the remote engine answered
    pub text: Vec<RecognitionToken>,
    /// Digit/symbol engine tokens
    pub digit: Vec<RecognitionToken>,
}

impl EngineOutputs {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.digit.is_empty()
    }
}

/// Why the worker could not complete a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFailure {
    /// Every engine in the fallback chain failed
    Engine { failures: Vec<String> },
    /// The payload was not a decodable image
    BadImage { message: String },
}

/// Responses sent by the worker to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Success {
        id: u64,
        #[serde(default)]
        result: EngineOutputs,
    },
    Error { id: u64, error: WorkerFailure },
    /// Fraction of engines finished; the request stays pending
    Progress { id: u64, progress: f32 },
}

impl WorkerResponse {
    /// Correlation id
    pub fn id(&self) -> u64 {
        match self {
            WorkerResponse::Success { id, .. }
            | WorkerResponse::Error { id, .. }
            | WorkerResponse::Progress { id, .. } => *id,
        }
    }

    /// Whether this response settles its request
    pub fn is_final(&self) -> bool {
        !matches!(self, WorkerResponse::Progress { .. })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{BoundingBox, RecognitionOptions, SourceEngine};

    #[test]
    fn test_request_json_format() {
        assert_eq!(
            WorkerRequest::Init { id: 1 }.to_json().unwrap(),
            r#"{"type":"init","id":1}"#
        );
        assert_eq!(
            WorkerRequest::Destroy { id: 9 }.to_json().unwrap(),
            r#"{"type":"destroy","id":9}"#
        );
    }

    #[test]
    fn test_recognize_request_roundtrip() {
        let request = WorkerRequest::Recognize {
            id: 42,
            payload: RecognitionRequest {
                image_bytes: vec![137, 80, 78, 71],
                options: RecognitionOptions::default(),
                request_id: "req-1".into(),
            },
        };
        let json = request.to_json().expect("should serialize");
        assert!(json.contains("\"type\":\"recognize\""));
        assert_eq!(WorkerRequest::from_json(&json).expect("should deserialize"), request);
        assert_eq!(request.id(), 42);
    }

    #[test]
    fn test_response_roundtrip() {
        let token = RecognitionToken::new("500", 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0), SourceEngine::Digit);
        let responses = vec![
            WorkerResponse::Success {
                id: 1,
                result: EngineOutputs {
                    text: Vec::new(),
                    digit: vec![token],
                },
            },
            WorkerResponse::Error {
                id: 2,
                error: WorkerFailure::Engine {
                    failures: vec!["text: model missing".into()],
                },
            },
            WorkerResponse::Progress { id: 3, progress: 0.5 },
        ];

        for response in responses {
            let json = response.to_json().expect("should serialize");
            assert_eq!(WorkerResponse::from_json(&json).expect("should deserialize"), response);
        }
    }

    #[test]
    fn test_success_without_result_defaults() {
        let response = WorkerResponse::from_json(r#"{"type":"success","id":5}"#).unwrap();
        assert_eq!(
            response,
            WorkerResponse::Success {
                id: 5,
                result: EngineOutputs::default()
            }
        );
        assert!(response.is_final());
    }

    #[test]
    fn test_progress_is_not_final() {
        let response = WorkerResponse::Progress { id: 3, progress: 0.5 };
        assert!(!response.is_final());
        assert_eq!(response.id(), 3);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(WorkerRequest::from_json(r#"{"type":"explode","id":1}"#).is_err());
        assert!(WorkerResponse::from_json("not json").is_err());
    }
}
