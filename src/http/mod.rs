pub(crate) mod request;
pub(crate) mod response;

pub use request::{CatalogRequestBuilder, HttpRequest, MonotonicClock, RequestKind};
pub use response::{parse_items, HttpResponse, Item, ItemId};
