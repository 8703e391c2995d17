use dns_types::protocol::types::Rcode;

/// An error that can occur while resolving a question.
///
/// This is the single terminal-result error type for the query
/// engine (see `query`): exactly one of `Ok` or `Err(ResolverError)`
/// reaches a completion callback.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ResolverError {
    /// Decoding or encoding the wire message failed.
    CodecError(String),
    /// A transport-level error occurred sending or receiving a
    /// datagram or stream.
    NetworkError(String),
    /// Every agent the query tried timed out.
    Timeout,
    /// There were no agents configured to ask.
    NoAgents,
    /// An agent answered with a non-`NoError` rcode and no more agents
    /// remained to try.
    ServerFailure(Rcode),
    /// The question's domain name could not be represented on the
    /// wire (too long, or an invalid label).
    BadDomainName,
    /// The query was cancelled before it completed.
    Cancelled,
}

impl std::fmt::Display for ResolverError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResolverError::CodecError(msg) => write!(f, "codec error: {msg}"),
            ResolverError::NetworkError(msg) => write!(f, "network error: {msg}"),
            ResolverError::Timeout => write!(f, "timed out"),
            ResolverError::NoAgents => write!(f, "no agents configured"),
            ResolverError::ServerFailure(rcode) => write!(f, "server failure: {rcode}"),
            ResolverError::BadDomainName => write!(f, "invalid domain name"),
            ResolverError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ResolverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

pub type ResolverResult<T> = Result<T, ResolverError>;
