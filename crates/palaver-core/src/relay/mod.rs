pub mod bridge;
pub mod engine;
pub mod registry;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod tests;
