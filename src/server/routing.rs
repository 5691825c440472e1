use crate::config::endpoint::{ClientConfiguration, ServerConfiguration};
use crate::messaging::envelope::EnvelopeHeader;
use crate::messaging::message::is_reserved_type;

/// Decides whether an envelope goes to a candidate receiver. Rules in order of precedence:
///
/// * internal request / response types reach only their explicit target
/// * types in the server's override filter reach everybody
/// * a sender gets its own message only if it asked for self-sent messages
/// * a targeted message reaches only its target
/// * a broadcast reaches every other client
///
/// Except for internal and override types, the candidate's receivable filter must accept the
///  type as well.
pub fn should_deliver(header: &EnvelopeHeader, candidate: &ClientConfiguration, server_config: &ServerConfiguration) -> bool {
    let type_info = header.payload_type_info.as_str();

    if is_reserved_type(type_info) {
        return header.target_id == candidate.id();
    }

    if server_config.is_override_type(type_info) {
        return true;
    }

    if header.client_id == candidate.id() {
        return candidate.receive_self_sent_messages && candidate.can_receive(type_info);
    }

    if !header.is_broadcast() {
        return header.target_id == candidate.id() && candidate.can_receive(type_info);
    }

    candidate.can_receive(type_info)
}

/// The server's own endpoint as a routing candidate: it never receives its own messages and
///  accepts every type.
pub fn internal_candidate(server_config: &ServerConfiguration) -> ClientConfiguration {
    ClientConfiguration::new(server_config.id())
}
