//! Explain formatting: width collection and the three buffer modes.

use std::fmt::Write as _;

use crate::error::Result;
use crate::operator::{LogicalPlan, OpId, OpKind};

/// Accumulates the printable plan.
#[derive(Default, Debug)]
pub struct PlanText {
    pub level: usize,
    pub name_width: usize,
    pub buf: String,
    header_written: bool,
}

impl PlanText {
    fn indented_name(&self, plan: &LogicalPlan, id: OpId) -> String {
        let mut name = " ".repeat(self.level);
        name.push_str(plan.op(id).kind.name());
        name
    }
}

impl LogicalPlan {
    /// Pre action of `EXPLAIN_COLLECT_WIDTH`.
    pub(crate) fn explain_collect_width_pre(&mut self, id: OpId, text: &mut PlanText) -> Result<()> {
        let width = text.indented_name(self, id).len();
        text.name_width = text.name_width.max(width);
        text.level += 1;
        Ok(())
    }

    pub(crate) fn explain_pop_level(&mut self, _id: OpId, text: &mut PlanText) -> Result<()> {
        text.level -= 1;
        Ok(())
    }

    /// Pre action of `EXPLAIN_WRITE_BUFFER`: one row per operator.
    pub(crate) fn explain_write_buffer_pre(&mut self, id: OpId, text: &mut PlanText) -> Result<()> {
        if !text.header_written {
            let _ = writeln!(
                text.buf,
                "|ID|{:name_width$}|EST. ROWS|COST|",
                "OPERATOR",
                name_width = text.name_width.max(8)
            );
            text.header_written = true;
        }
        let name = text.indented_name(self, id);
        let node = self.op(id);
        let _ = writeln!(
            text.buf,
            "|{:>2}|{:name_width$}|{:>9.0}|{:>4.0}|",
            node.op_id.unwrap_or(0),
            name,
            node.card,
            node.cost,
            name_width = text.name_width.max(8)
        );
        text.level += 1;
        Ok(())
    }

    /// Pre action of `EXPLAIN_WRITE_BUFFER_OUTPUT`: the row plus output
    /// and filter columns.
    pub(crate) fn explain_write_buffer_output_pre(
        &mut self,
        id: OpId,
        text: &mut PlanText,
    ) -> Result<()> {
        self.explain_write_buffer_pre(id, text)?;
        let node = self.op(id);
        let outputs: Vec<String> = node
            .output_exprs
            .iter()
            .map(|e| self.exprs.display_name(*e))
            .collect();
        let filters: Vec<String> = node
            .filter_exprs
            .iter()
            .map(|e| self.exprs.display_name(*e))
            .collect();
        let _ = writeln!(
            text.buf,
            "      output([{}]), filter([{}])",
            outputs.join(", "),
            filters.join(", ")
        );
        Ok(())
    }

    /// Pre action of `EXPLAIN_WRITE_BUFFER_OUTLINE`: hint text that pins
    /// this plan shape.
    pub(crate) fn explain_write_buffer_outline_pre(
        &mut self,
        id: OpId,
        text: &mut PlanText,
    ) -> Result<()> {
        if !text.header_written {
            text.buf.push_str("/*+\n");
            text.header_written = true;
        }
        match &self.op(id).kind {
            OpKind::Join { algo, .. } => {
                let hint = match algo {
                    crate::operator::JoinAlgo::Hash => "USE_HASH",
                    crate::operator::JoinAlgo::Merge => "USE_MERGE",
                    crate::operator::JoinAlgo::NestedLoop => "USE_NL",
                };
                let _ = writeln!(text.buf, "  {hint}");
            }
            OpKind::TableScan(scan) => {
                let _ = writeln!(text.buf, "  FULL({})", scan.table_name);
            }
            _ => {}
        }
        if self.op(id).children.is_empty() && self.op(id).is_plan_root {
            text.buf.push_str("*/\n");
        }
        text.level += 1;
        Ok(())
    }

    /// Post of the outline mode closes the hint block at the root.
    pub(crate) fn explain_outline_post(&mut self, id: OpId, text: &mut PlanText) -> Result<()> {
        text.level -= 1;
        if self.op(id).is_plan_root && !text.buf.ends_with("*/\n") {
            text.buf.push_str("*/\n");
        }
        Ok(())
    }
}
