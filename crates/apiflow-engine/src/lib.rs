pub mod assertion;
pub mod events;
mod executor;
pub mod suite;
pub mod transport;
pub mod wait;

pub use events::ExecutionEvent;
pub use executor::{NodeError, TestCaseExecutor};
pub use suite::{CaseHooks, HooksFactory, SuiteResult, SuiteRunner, SuiteStatus};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
