//! User executables hosted by workers

use gangrun_core::{env, GangrunResult};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;

/// Type-erased executable instance owned by a worker
pub type AnyExecutable = Box<dyn Any + Send>;

/// Function applied to a worker's executable; the result crosses back as JSON
pub type ExecuteFn = Box<dyn FnOnce(&mut (dyn Any + Send)) -> GangrunResult<Value> + Send>;

/// Function applied on a worker independent of its executable
pub type RunFn = Box<dyn FnOnce(&WorkerContext) -> GangrunResult<Value> + Send>;

/// What an executable sees of the worker it is created on
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub world_rank: u32,
    pub world_size: u32,
    pub hostname: String,
    /// Environment materialized on the worker at creation time
    pub env: HashMap<String, String>,
}

impl WorkerContext {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn local_rank(&self) -> Option<u32> {
        self.get_u32(env::LOCAL_RANK)
    }

    pub fn local_size(&self) -> Option<u32> {
        self.get_u32(env::LOCAL_SIZE)
    }

    pub fn cross_rank(&self) -> Option<u32> {
        self.get_u32(env::CROSS_RANK)
    }

    pub fn cross_size(&self) -> Option<u32> {
        self.get_u32(env::CROSS_SIZE)
    }
}

/// Builds the executable a worker hosts once the group is ready
pub trait ExecutableFactory: Send + Sync {
    fn create(&self, ctx: &WorkerContext) -> GangrunResult<AnyExecutable>;
}

impl<F, E> ExecutableFactory for F
where
    F: Fn(&WorkerContext) -> GangrunResult<E> + Send + Sync,
    E: Send + 'static,
{
    fn create(&self, ctx: &WorkerContext) -> GangrunResult<AnyExecutable> {
        Ok(Box::new(self(ctx)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> WorkerContext {
        WorkerContext {
            world_rank: 2,
            world_size: 4,
            hostname: "node-a".to_string(),
            env: HashMap::from([
                (env::LOCAL_RANK.to_string(), "1".to_string()),
                (env::LOCAL_SIZE.to_string(), "2".to_string()),
            ]),
        }
    }

    #[test]
    fn test_context_accessors() {
        let ctx = context();
        assert_eq!(ctx.local_rank(), Some(1));
        assert_eq!(ctx.local_size(), Some(2));
        assert_eq!(ctx.cross_rank(), None);
    }

    #[test]
    fn test_closure_factory() {
        let factory = |ctx: &WorkerContext| Ok::<_, gangrun_core::GangrunError>(ctx.world_rank * 10);
        let exe = factory.create(&context()).unwrap();
        assert_eq!(exe.downcast_ref::<u32>(), Some(&20));
    }
}
