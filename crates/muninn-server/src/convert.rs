use muninn_types::CacheError;
use tonic::Status;

pub fn cache_to_status(err: CacheError) -> Status {
    match &err {
        CacheError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        CacheError::EmptyRing => Status::failed_precondition(err.to_string()),
        CacheError::StoreUnavailable(_)
        | CacheError::Peer(_)
        | CacheError::Coordination(_) => Status::unavailable(err.to_string()),
        CacheError::Store(_) | CacheError::Codec(_) | CacheError::PeerRejected(_) => {
            Status::internal(err.to_string())
        }
        CacheError::Timeout => Status::deadline_exceeded(err.to_string()),
    }
}
