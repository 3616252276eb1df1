mod provider_tests;
mod support;
mod worker_tests;
