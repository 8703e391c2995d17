//! The query engine (component C5): resolves one question by driving
//! the per-agent state machine
//! `INIT -> BUILT -> SENT_UDP -> (RECEIVED | TIMED_OUT | TRUNCATED)
//!   -> [SENT_TCP -> (RECEIVED | TIMED_OUT)] -> COMPLETE`
//! across the agents selected by a [`Strategy`], falling over to the
//! next agent on timeout and promoting to TCP on truncation without
//! moving to the next agent.

use std::net::SocketAddr;

use dns_types::protocol::types::{Message, Opcode, Question, Rcode};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::Instrument;

use crate::agent::{select_order, AgentParams, Strategy, Transport};
use crate::error::{ResolverError, ResolverResult};
use crate::transport::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes};

/// Resolve `question` by asking `agents` in the order `strategy`
/// picks, falling through to the next agent whenever one times out or
/// never answers. A `ServerFailure` is never retried against another
/// agent — it is a genuine reply and is returned to the caller as
/// soon as it is seen. `id` is the transaction ID the caller (the
/// resolver facade, which owns the active-query table) has already
/// allocated for this query; it is reused verbatim across every
/// agent and transport attempt made on its behalf. `initial_transport`
/// is the transport the first attempt against each agent starts on;
/// `Transport::Tcp` skips the UDP round entirely, per §6's resolve
/// signature.
pub async fn resolve_via_agents(
    id: u16,
    question: &Question,
    recursion_desired: bool,
    agents: &[AgentParams],
    strategy: &Strategy,
    round_robin_counter: u64,
    initial_transport: Transport,
) -> ResolverResult<Message> {
    let ordered = select_order(agents, strategy, round_robin_counter);
    if ordered.is_empty() {
        return Err(ResolverError::NoAgents);
    }

    let mut request = Message::from_question(id, question.clone());
    request.header.recursion_desired = recursion_desired;

    let mut last_error = ResolverError::Timeout;

    for agent in &ordered {
        let span = tracing::error_span!("query_agent", agent = %agent.name, address = %agent.address);
        match query_one_agent(&request, agent, initial_transport).instrument(span).await {
            Ok(response) => return Ok(response),
            // a server failure is a genuine reply, not a recoverable
            // per-agent hiccup - surface it instead of falling through
            // to the next agent, per §4.5/§7.
            Err(err @ ResolverError::ServerFailure(_)) => return Err(err),
            Err(err) => last_error = err,
        }
    }

    Err(last_error)
}

/// Drives one agent through `SENT_UDP` (or, if `initial_transport` is
/// `Tcp`, straight to `SENT_TCP`) and, on UDP truncation, promotes to
/// `SENT_TCP` against the same agent. A response that doesn't match
/// the outstanding question (wrong ID, wrong opcode, or a different
/// question) is discarded and this keeps listening for the remainder
/// of the agent's timeout window rather than treating it as a failed
/// attempt; see `udp_round`.
async fn query_one_agent(
    request: &Message,
    agent: &AgentParams,
    initial_transport: Transport,
) -> ResolverResult<Message> {
    let serialised = request.to_octets().map_err(|err| {
        tracing::warn!(message = ?request, %err, "could not serialise message");
        ResolverError::CodecError(err.to_string())
    })?;

    tracing::trace!(message = ?request, address = ?agent.address, agent = %agent.name, ?initial_transport, "querying agent");

    if matches!(initial_transport, Transport::Tcp) {
        return query_one_agent_tcp(request, agent, serialised.to_vec()).await;
    }

    let response = match timeout(agent.timeout(), udp_round(agent.address, &serialised, request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            tracing::debug!(address = ?agent.address, %err, "udp query failed");
            return Err(ResolverError::NetworkError(err.to_string()));
        }
        Err(_) => {
            tracing::debug!(address = ?agent.address, "udp query timed out");
            return Err(ResolverError::Timeout);
        }
    };

    if matches!(response.header.rcode, Rcode::ServerFailure) {
        return Err(ResolverError::ServerFailure(response.header.rcode));
    }
    if response.header.is_truncated {
        tracing::trace!(address = ?agent.address, "response truncated, promoting to tcp");
        return query_one_agent_tcp(request, agent, serialised.to_vec()).await;
    }
    Ok(response)
}

async fn query_one_agent_tcp(
    request: &Message,
    agent: &AgentParams,
    mut serialised: Vec<u8>,
) -> ResolverResult<Message> {
    match timeout(
        agent.timeout(),
        send_and_receive_tcp(agent.address, &mut serialised),
    )
    .await
    {
        Ok(Ok(response)) if response_matches_request(request, &response) => {
            if matches!(response.header.rcode, Rcode::ServerFailure) {
                Err(ResolverError::ServerFailure(response.header.rcode))
            } else {
                Ok(response)
            }
        }
        Ok(Ok(_)) => Err(ResolverError::Timeout),
        Ok(Err(err)) => Err(ResolverError::NetworkError(err.to_string())),
        Err(_) => Err(ResolverError::Timeout),
    }
}

/// Sends `serialised` over a fresh UDP socket and keeps receiving
/// until a response matching `request` arrives; non-matching
/// responses and undecodable datagrams are discarded and listening
/// continues. The caller bounds the total time spent here with
/// `tokio::time::timeout`.
async fn udp_round(
    address: SocketAddr,
    serialised: &bytes::BytesMut,
    request: &Message,
) -> Result<Message, crate::transport::TransportError> {
    let sock = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|error| crate::transport::TransportError::Io { error })?;
    sock.connect(address)
        .await
        .map_err(|error| crate::transport::TransportError::Io { error })?;

    let mut bytes = serialised.to_vec();
    send_udp_bytes(&sock, &mut bytes).await?;

    loop {
        let mut buf = vec![0u8; 65536];
        let n = sock
            .recv(&mut buf)
            .await
            .map_err(|error| crate::transport::TransportError::Io { error })?;

        if let Ok(response) = Message::from_octets(&buf[..n]) {
            if response_matches_request(request, &response) {
                return Ok(response);
            }
        }
    }
}

async fn send_and_receive_tcp(
    address: SocketAddr,
    bytes: &mut [u8],
) -> Result<Message, crate::transport::TransportError> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|error| crate::transport::TransportError::Io { error })?;
    send_tcp_bytes(&mut stream, bytes).await?;
    let received = read_tcp_bytes(&mut stream).await?;

    Message::from_octets(&received)
        .map_err(|_| crate::transport::TransportError::ShortRead { expected: 0, actual: 0 })
}

/// A response whose question section does not match the outstanding
/// query's question is discarded and the query keeps waiting until
/// its timeout rather than accepting it; see `udp_round`. The
/// response code is deliberately not checked here - `ServerFailure`
/// and `NameError` both "match" and are handled by the caller, which
/// decides whether to retry the next agent or return the message as
/// the caller's answer.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id {
        return false;
    }
    if !response.header.is_response {
        return false;
    }
    if request.header.opcode != response.header.opcode {
        return false;
    }
    if request.questions != response.questions {
        return false;
    }
    true
}

pub mod iterative {
    //! Iterative resolution: follow NS/glue delegations from the
    //! root down to an authoritative answer, instead of asking a
    //! single configured recursive agent.
    //!
    //! This is new work grounded in the "match_count widens with each
    //! referral" shape of a classic recursive-resolver delegation
    //! chase, not a port of anything upstream of it: the authority
    //! data for each referral is looked up by asking the most
    //! specific known nameservers for the question, and each step's
    //! winning referral must have more matching labels than the last.
    use std::net::SocketAddr;

    use dns_types::protocol::types::{
        DomainName, QueryClass, QueryType, Question, RecordClass, RecordType, RecordTypeWithData,
    };
    use tracing::Instrument;

    use crate::agent::{AgentParams, Strategy, Transport};
    use crate::error::{ResolverError, ResolverResult};

    /// A conservative bound on the number of referrals to follow
    /// before giving up, so that a misconfigured or malicious zone
    /// cannot cause unbounded recursion.
    pub const MAX_REFERRAL_DEPTH: usize = 30;

    /// A bound on how many glueless NS hostnames get sub-resolved
    /// before giving up on a referral entirely, independent of
    /// [`MAX_REFERRAL_DEPTH`] (which bounds the length of one
    /// delegation chain, not the fan-out of sub-queries a single
    /// glueless referral can spawn).
    const MAX_GLUELESS_SUBQUERY_DEPTH: usize = 5;

    /// One step of iterative resolution: the nameservers believed to
    /// be authoritative for `domain`, and how many labels of the
    /// original question they matched (wider match = more specific
    /// delegation, and each step must strictly widen this).
    #[derive(Debug, Clone)]
    pub struct Delegation {
        pub domain: DomainName,
        pub match_count: usize,
        pub nameservers: Vec<SocketAddr>,
    }

    /// Resolve `question` iteratively, starting from `roots` (the
    /// root hints) and following referrals until an authoritative
    /// answer, a negative answer, or [`MAX_REFERRAL_DEPTH`] is
    /// reached. Any NS hostname a referral names without accompanying
    /// glue is sub-resolved by recursing into this same walk from the
    /// same roots (see §4.5: "If no glue is present for an NS, it
    /// must be resolved first via a sub-query").
    pub async fn resolve_iteratively(
        question: &Question,
        roots: &[AgentParams],
    ) -> ResolverResult<dns_types::protocol::types::Message> {
        resolve_iteratively_inner(question, roots, 0).await
    }

    async fn resolve_iteratively_inner(
        question: &Question,
        roots: &[AgentParams],
        subquery_depth: usize,
    ) -> ResolverResult<dns_types::protocol::types::Message> {
        let mut current = Delegation {
            domain: DomainName::root_domain(),
            match_count: 0,
            nameservers: roots.iter().map(|a| a.address).collect(),
        };

        for depth in 0..MAX_REFERRAL_DEPTH {
            let agents: Vec<AgentParams> = current
                .nameservers
                .iter()
                .enumerate()
                .map(|(i, addr)| AgentParams {
                    name: format!("iterative-{i}"),
                    address: *addr,
                    timeout_millis: 5000,
                    priority: 0,
                })
                .collect();

            let span = tracing::error_span!("iterative_step", domain = %current.domain, depth);
            let response = super::resolve_via_agents(
                rand::random(),
                question,
                false,
                &agents,
                &crate::agent::Strategy::Priority,
                0,
                crate::agent::Transport::Udp,
            )
            .instrument(span)
            .await?;

            if !response.answers.is_empty() {
                tracing::trace!("got iterative answer");
                return Ok(response);
            }

            let mut referral_ns: Vec<DomainName> = Vec::new();
            let mut referral_domain: Option<DomainName> = None;
            for rr in &response.authority {
                if let RecordTypeWithData::NS { nsdname } = &rr.rtype_with_data {
                    if question.name.is_subdomain_of(&rr.name)
                        && rr.name.labels.len() > current.match_count
                    {
                        referral_domain = Some(rr.name.clone());
                        referral_ns.push(nsdname.clone());
                    }
                }
            }

            let Some(next_domain) = referral_domain else {
                // no wider referral: either a negative answer or the
                // authority this loop has already asked is final.
                tracing::trace!("no wider referral, treating response as final");
                return Ok(response);
            };

            tracing::trace!(referral = %next_domain, "got referral");

            let mut next_addrs = Vec::new();
            for ns in &referral_ns {
                for rr in &response.additional {
                    if &rr.name == ns {
                        match &rr.rtype_with_data {
                            RecordTypeWithData::A { address } => {
                                next_addrs.push(SocketAddr::new((*address).into(), 53));
                            }
                            RecordTypeWithData::AAAA { address } => {
                                next_addrs.push(SocketAddr::new((*address).into(), 53));
                            }
                            _ => {}
                        }
                    }
                }
            }

            if next_addrs.is_empty() {
                if subquery_depth >= MAX_GLUELESS_SUBQUERY_DEPTH {
                    tracing::warn!(referral = %next_domain, "glueless referral, hit sub-query depth limit");
                    return Err(ResolverError::NoAgents);
                }

                tracing::trace!(referral = %next_domain, ns = ?referral_ns, "glueless referral, sub-resolving nameserver address");
                for ns in &referral_ns {
                    let ns_question = Question {
                        name: ns.clone(),
                        qtype: QueryType::Record(RecordType::A),
                        qclass: QueryClass::Record(RecordClass::IN),
                    };

                    // boxed because this async fn recurses into itself,
                    // which an unboxed future can't be sized for.
                    let sub_result = Box::pin(resolve_iteratively_inner(
                        &ns_question,
                        roots,
                        subquery_depth + 1,
                    ))
                    .await;

                    match sub_result {
                        Ok(sub_response) => {
                            for rr in &sub_response.answers {
                                match &rr.rtype_with_data {
                                    RecordTypeWithData::A { address } => {
                                        next_addrs.push(SocketAddr::new((*address).into(), 53));
                                    }
                                    RecordTypeWithData::AAAA { address } => {
                                        next_addrs.push(SocketAddr::new((*address).into(), 53));
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Err(err) => {
                            tracing::debug!(%ns, %err, "failed to resolve glueless nameserver");
                        }
                    }

                    if !next_addrs.is_empty() {
                        break;
                    }
                }

                if next_addrs.is_empty() {
                    tracing::warn!(referral = %next_domain, "could not resolve any nameserver for glueless referral");
                    return Err(ResolverError::NoAgents);
                }
            }

            current = Delegation {
                match_count: next_domain.labels.len(),
                domain: next_domain,
                nameservers: next_addrs,
            };
        }

        tracing::debug!("hit referral depth limit");
        Err(ResolverError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use dns_types::protocol::types::test_util::{a_record, domain};
    use dns_types::protocol::types::{QueryClass, QueryType, RecordClass, RecordType};

    use super::*;

    fn question(name: &str) -> Question {
        Question {
            name: domain(name),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        }
    }

    #[test]
    fn response_matches_request_checks_id_and_opcode() {
        let request = Message::from_question(1234, question("www.example.com."));
        let mut response = request.make_response();
        response.answers = vec![a_record("www.example.com.", std::net::Ipv4Addr::new(1, 1, 1, 1))];

        assert!(response_matches_request(&request, &response));

        let mut bad_id = response.clone();
        bad_id.header.id += 1;
        assert!(!response_matches_request(&request, &bad_id));

        let mut bad_opcode = response.clone();
        bad_opcode.header.opcode = Opcode::Status;
        assert!(!response_matches_request(&request, &bad_opcode));
    }

    #[test]
    fn response_matches_request_rejects_truncated_is_still_accepted_here() {
        // truncation is handled by the caller (promote to TCP), not by
        // response_matches_request - a truncated-but-matching response
        // still "matches".
        let request = Message::from_question(1, question("www.example.com."));
        let mut response = request.make_response();
        response.header.is_truncated = true;

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_rejects_mismatched_question() {
        let request = Message::from_question(1, question("www.example.com."));
        let mut response = request.make_response();
        response.questions = vec![question("other.example.com.")];

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_matches_regardless_of_rcode() {
        // rcode interpretation (retry on ServerFailure, return
        // NameError as-is) is the caller's job, not matching's.
        let request = Message::from_question(1, question("www.example.com."));
        let mut response = request.make_response();
        response.header.rcode = dns_types::protocol::types::Rcode::ServerFailure;

        assert!(response_matches_request(&request, &response));
    }

    /// Scenario 6: a mock UDP server that always replies with the TC
    /// bit set, and a TCP server bound to the same address that
    /// answers normally. The engine must promote to TCP against the
    /// *same* agent rather than moving on to another one.
    #[tokio::test]
    async fn truncated_udp_response_is_promoted_to_tcp() {
        use tokio::net::{TcpListener, UdpSocket};

        let udp_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp_sock.local_addr().unwrap();
        let tcp_listener = TcpListener::bind(udp_addr).await.unwrap();

        let q = question("www.example.com.");
        let expected_answer = a_record("www.example.com.", std::net::Ipv4Addr::new(9, 9, 9, 9));
        let expected_answer_clone = expected_answer.clone();

        let udp_task = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = udp_sock.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..n]).unwrap();
            let mut response = request.make_response();
            response.header.is_truncated = true;
            let bytes = response.to_octets().unwrap();
            udp_sock.send_to(&bytes, peer).await.unwrap();
        });

        let tcp_task = tokio::spawn(async move {
            let (mut stream, _) = tcp_listener.accept().await.unwrap();
            let received = read_tcp_bytes(&mut stream).await.unwrap();
            let request = Message::from_octets(&received).unwrap();
            let mut response = request.make_response();
            response.answers = vec![expected_answer_clone];
            let mut bytes = response.to_octets().unwrap().to_vec();
            send_tcp_bytes(&mut stream, &mut bytes).await.unwrap();
        });

        let agent = AgentParams {
            name: "mock".to_string(),
            address: udp_addr,
            timeout_millis: 2000,
            priority: 0,
        };

        let result = query_one_agent(&Message::from_question(1, q), &agent, Transport::Udp).await;
        udp_task.await.unwrap();
        tcp_task.await.unwrap();

        let response = result.expect("promoted TCP query should succeed");
        assert_eq!(vec![expected_answer], response.answers);
    }

    /// A `ServerFailure` from the first agent must be surfaced
    /// directly, not retried against the second (which would
    /// otherwise answer successfully here, masking the failure).
    #[tokio::test]
    async fn server_failure_is_not_retried_against_next_agent() {
        use tokio::net::UdpSocket;

        let failing_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let failing_addr = failing_sock.local_addr().unwrap();
        let healthy_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let healthy_addr = healthy_sock.local_addr().unwrap();

        let failing_task = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = failing_sock.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..n]).unwrap();
            let mut response = request.make_response();
            response.header.rcode = Rcode::ServerFailure;
            let bytes = response.to_octets().unwrap();
            failing_sock.send_to(&bytes, peer).await.unwrap();
        });

        let healthy_task = tokio::spawn(async move {
            // only reached if the engine wrongly falls through to the
            // second agent; left running so the test can assert the
            // first agent's datagram already satisfied the query.
            let mut buf = [0u8; 512];
            let _ = healthy_sock.recv_from(&mut buf).await;
        });

        let agents = vec![
            AgentParams {
                name: "failing".to_string(),
                address: failing_addr,
                timeout_millis: 2000,
                priority: 1,
            },
            AgentParams {
                name: "healthy".to_string(),
                address: healthy_addr,
                timeout_millis: 2000,
                priority: 0,
            },
        ];

        let result = resolve_via_agents(
            1,
            &question("www.example.com."),
            true,
            &agents,
            &Strategy::Priority,
            0,
            Transport::Udp,
        )
        .await;

        failing_task.await.unwrap();
        healthy_task.abort();

        assert_eq!(Err(ResolverError::ServerFailure(Rcode::ServerFailure)), result);
    }
}
