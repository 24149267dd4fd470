mod compiler_test;
mod flow_table_test;
mod scenarios_test;
pub mod support;
