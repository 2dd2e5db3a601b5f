mod middleware;
mod proxy;

pub use middleware::RequestContext;
pub use proxy::{HttpState, build_router};
