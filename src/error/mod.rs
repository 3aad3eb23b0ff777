mod castor;
mod oauth;
mod resolve;

pub use castor::{ApiErrorBody, ApiErrorObject, CastorError};
pub use oauth::OauthError;
pub use resolve::ResolveError;

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
