//! Interpreter facade: source text in, final value out.

use std::sync::Arc;

use quarry_client::Client;
use thiserror::Error;

use crate::evaluator::{EvalError, Evaluator};
use crate::host::{HostBridge, NativeBridge};
use crate::parser::{ParseError, Parser};
use crate::value::{Env, Value};

/// Any failure of a `run` invocation. Per-request transport errors are not
/// represented here: they surface as responses with `status == -1`.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("eval error: {0}")]
    Eval(#[from] EvalError),
}

pub struct Interpreter {
    client: Client,
    bridge: Arc<dyn HostBridge>,
}

impl Interpreter {
    pub fn new(client: Client) -> Self {
        Self::with_bridge(client, Arc::new(NativeBridge::new()))
    }

    pub fn with_bridge(client: Client, bridge: Arc<dyn HostBridge>) -> Self {
        Self { client, bridge }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Lex, parse, and evaluate a pipeline program.
    pub async fn run(
        &self,
        source: &str,
        global_env: Env,
        local_env: Env,
    ) -> Result<Value, ScriptError> {
        let program = Parser::new(source)?.parse()?;
        let evaluator = Evaluator::with_bridge(&self.client, Arc::clone(&self.bridge));
        Ok(evaluator.eval(&program, global_env, local_env).await?)
    }

    /// Close the owned client.
    pub async fn close(self) {
        self.client.close().await;
    }
}
