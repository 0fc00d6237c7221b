// Anti-bot protection handling: page analysis, bypass loops, and browser user agents.

pub mod core;
pub mod solvers;
pub mod user_agents;
