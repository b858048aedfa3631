#[cfg(unix)]
mod runner_test;
