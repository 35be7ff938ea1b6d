mod extract;
mod invoker;

pub use extract::{extract_response, Extraction, NO_RESPONSE};
pub use invoker::{AgentInvoker, MAX_ITERATIONS_EXCEEDED, SYSTEM_INSTRUCTION};
