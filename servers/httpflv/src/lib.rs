pub mod errors;
pub mod http;
pub mod session;
pub mod tag;

pub use session::{
    FLV_HEADER, FLV_HTTP_RESPONSE_HEADER, SubSession, SubSessionKind, SubSessionStat,
    TS_HTTP_RESPONSE_HEADER,
};
pub use tag::{MediaTag, TagKind};
