use std::result;

use replog_api::{Consistency, LogOffset};

use crate::std::{Client, RawClient};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("raw error: {0}")]
    Raw(#[from] crate::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Client storing values of `T` as MessagePack records
pub struct MsgPackClient<T> {
    inner: RawClient,
    _type: ::std::marker::PhantomData<T>,
}

impl<T> MsgPackClient<T> {
    pub fn new(inner: RawClient) -> Self {
        Self {
            inner,
            _type: ::std::marker::PhantomData,
        }
    }

    pub fn into_inner(self) -> RawClient {
        self.inner
    }
}

impl<T> Client for MsgPackClient<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    type InRecord<'a> = &'a T;
    type OutRecord = T;
    type Error = Error;

    fn produce(&mut self, record: &T) -> Result<LogOffset> {
        Ok(self.inner.produce(&rmp_serde::encode::to_vec(record)?)?)
    }

    fn consume(&mut self, offset: LogOffset, consistency: Consistency) -> Result<T> {
        Ok(rmp_serde::decode::from_slice(
            &self.inner.consume(offset, consistency)?,
        )?)
    }
}
