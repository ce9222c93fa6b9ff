use crate::OrdError;

pub type OrdResult<T> = std::result::Result<T, OrdError>;
