//! Test utilities for arena-based testing.
//!
//! Every pipeline run in a test gets its own bounded arena, mirroring how an
//! embedding compiler scopes one session per compilation.

#[cfg(test)]
pub mod test {
    use super::super::session::PipelineSession;
    use crate::ir::builder::Builder;
    use crate::ir::module::{BlockId, Module, OpId};
    use crate::ir::ops::Visibility;
    use crate::ir::types::{FunctionType, Type};
    use bumpalo::Bump;

    /// Test context that manages arena lifetime for tests.
    pub struct TestContext {
        arena: Bump,
    }

    impl TestContext {
        /// Create a new test context with default capacity.
        pub fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            Self { arena: Bump::new() }
        }

        /// Create a pipeline session using this context's arena.
        pub fn create_session(&self) -> PipelineSession<'_> {
            PipelineSession::new(&self.arena)
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Public function `name` appended to `m`; returns it with its entry block.
    pub fn build_func(m: &mut Module, name: &str, inputs: Vec<Type>, results: Vec<Type>) -> (OpId, BlockId) {
        let body = m.body();
        let f = Builder::at_end(m, body).func(name, FunctionType::new(inputs, results), Visibility::Public);
        let entry = m.body_block(f, 0);
        (f, entry)
    }
}
