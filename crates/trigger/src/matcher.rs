//! Match decoded build messages against registered subscribers.
//!
//! Pure functions: no I/O, no shared state beyond the snapshot passed in.

use tracing::{debug, warn};

use ktrigger_core::ParameterDefinition;
use ktrigger_queue::{BuildMessage, MessageParameter};

use crate::dispatcher::{cause_for_topic, BuildParameter, DispatchRequest};
use crate::registry::RegistrySnapshot;

/// Find every subscriber the message addresses and build its dispatch.
///
/// A subscriber matches iff it has a non-empty token equal (case-sensitive)
/// to the message token and its project equals the message project.
/// Subscribers without a token are skipped. An empty result is normal.
pub fn match_message(message: &BuildMessage, snapshot: &RegistrySnapshot, topic: &str) -> Vec<DispatchRequest> {
    let mut requests = Vec::new();

    for subscriber in snapshot.iter() {
        let token = match subscriber.auth_token.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => {
                if subscriber.project == message.project {
                    warn!(project = %subscriber.project, "ignoring build message: subscriber has no token set");
                }
                continue;
            }
        };

        if subscriber.project != message.project || token != message.token {
            continue;
        }

        requests.push(DispatchRequest {
            project: subscriber.project.clone(),
            cause: cause_for_topic(topic),
            parameters: reconcile_parameters(&subscriber.parameters, message.parameters()),
        });
    }

    if requests.is_empty() {
        debug!(project = %message.project, "build message matched no subscriber");
    }
    requests
}

/// Shape message-supplied values onto the subscriber's defined parameters.
///
/// For each definition the first message parameter whose name matches
/// case-insensitively supplies the value; the definition's own spelling is
/// kept. Definitions the message does not mention produce no entry.
pub fn reconcile_parameters(definitions: &[ParameterDefinition], supplied: &[MessageParameter]) -> Vec<BuildParameter> {
    definitions
        .iter()
        .filter_map(|def| {
            supplied
                .iter()
                .find(|p| p.name.to_uppercase() == def.name.to_uppercase())
                .map(|p| BuildParameter::new(def.name.clone(), p.value.clone()))
        })
        .collect()
}
