mod support;

mod gc_tests;
mod vtime_tests;
