use std::time::{Duration, Instant};

use mitmlearn_alphabet::{InputSymbol, Origin, OutputSymbol, Query, Response, Sentinel};
use tracing::debug;

use crate::encoder::{ActionExecutor, EncoderError};
use crate::sut::SutControl;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Session produced no output symbols")]
    EmptyResponse,

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),
}

/// Configuration for a [`SessionDriver`].
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Stop at the first absorbing output and pad the rest.
    pub early_termination: bool,
    /// Symbols executed before every query and trimmed from its answer.
    pub preseed: Vec<InputSymbol>,
}

/// Result of one executed session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub response: Response,
    /// Wall time of each executed action after the preseed.
    pub transition_times: Vec<Duration>,
    /// SUT traces before each action, plus one at the end.
    pub traces: Vec<Vec<String>>,
}

/// Runs a query against live peers, one action at a time.
pub struct SessionDriver {
    config: DriverConfig,
}

impl SessionDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn run<E, S>(
        &self,
        query: &Query,
        executor: &mut E,
        sut: &mut S,
    ) -> Result<SessionOutcome, DriverError>
    where
        E: ActionExecutor + ?Sized,
        S: SutControl + ?Sized,
    {
        let inputs: Vec<&InputSymbol> = self
            .config
            .preseed
            .iter()
            .chain(query.symbols())
            .collect();
        let mut outputs: Vec<OutputSymbol> = Vec::with_capacity(inputs.len());
        let mut timestamps = vec![Instant::now()];
        let mut traces = Vec::with_capacity(inputs.len() + 1);

        for symbol in &inputs {
            traces.push(sut.traces());
            let output = match symbol.origin {
                Origin::Mitm => executor.execute(&symbol.action)?,
                Origin::Sut => {
                    debug!(symbol = %symbol, "no command channel to the SUT");
                    Sentinel::Error.into()
                }
            };
            timestamps.push(Instant::now());
            debug!(input = %symbol, output = %output, "step");

            let absorbed = output.absorption();
            outputs.push(output);
            if self.config.early_termination {
                if let Some(sentinel) = absorbed {
                    while outputs.len() < inputs.len() {
                        outputs.push(sentinel.into());
                    }
                    break;
                }
            }
        }
        traces.push(sut.traces());

        if outputs.is_empty() {
            return Err(DriverError::EmptyResponse);
        }
        let preseed = self.config.preseed.len();
        let transition_times = timestamps
            .windows(2)
            .map(|w| w[1] - w[0])
            .skip(preseed)
            .collect();
        Ok(SessionOutcome {
            response: Response::new(outputs).skip(preseed),
            transition_times,
            traces,
        })
    }
}
