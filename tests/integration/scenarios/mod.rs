pub mod server_tests;
pub mod shutdown_tests;
pub mod teardown_tests;
