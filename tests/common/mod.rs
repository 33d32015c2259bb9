#![allow(dead_code)]

pub use qa_test_utils::{
    builders, fake_runner, fake_worker, init_tracing, recorder, scripted_backend, with_timeout,
};
