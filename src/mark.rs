use async_trait::async_trait;
use smallvec::SmallVec;

use crate::chain::{Next, Stage};
use crate::context::QueryContext;
use crate::error::{ConfigError, Result};

/// Opaque integer tags carried on the query context. As a stage the
/// marks are set and the chain continues; as a predicate, [`matches`]
/// tests whether the context already carries any of them.
///
/// [`matches`]: Marks::matches
pub struct Marks {
    values: SmallVec<[u32; 8]>,
}

impl Marks {
    /// Parse a whitespace-separated list of u32 literals in decimal,
    /// hex (`0x`), octal (`0o`) or binary (`0b`) form.
    pub fn parse(s: &str) -> std::result::Result<Self, ConfigError> {
        let mut values = SmallVec::new();
        for token in s.split_whitespace() {
            values.push(parse_u32_literal(token)?);
        }
        Ok(Marks { values })
    }

    /// True when the context carries any of the configured marks.
    pub fn matches(&self, ctx: &QueryContext) -> bool {
        self.values.iter().any(|&mark| ctx.has_mark(mark))
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }
}

#[async_trait]
impl Stage for Marks {
    async fn execute(&self, ctx: &mut QueryContext, next: Next) -> Result<()> {
        for &mark in &self.values {
            ctx.set_mark(mark);
        }
        next.run(ctx).await
    }
}

fn parse_u32_literal(token: &str) -> std::result::Result<u32, ConfigError> {
    let parsed = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(oct) = token.strip_prefix("0o").or_else(|| token.strip_prefix("0O")) {
        u32::from_str_radix(oct, 8)
    } else if let Some(bin) = token.strip_prefix("0b").or_else(|| token.strip_prefix("0B")) {
        u32::from_str_radix(bin, 2)
    } else {
        token.parse::<u32>()
    };
    parsed.map_err(|_| ConfigError::InvalidMark(token.to_string()))
}
