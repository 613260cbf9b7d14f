//! Query execution: plan construction, cursors and result rows.

pub mod cursor;
pub mod plan;
pub mod row;

pub use cursor::Cursor;
pub use plan::{Load, NodeType, Plan, PlanNode, ReaderPlan, ReaderType};
