// Pipeline executor - ordered continuation-passing steps

use crate::error::{NodbError, Result};

/// A single unit of work. It receives the continuation for the rest of the
/// chain and whatever the previous step forwarded.
pub type Step<'a, A, R> = Box<dyn FnOnce(Next<'a, A, R>, A) -> Result<Option<R>> + 'a>;

/// An ordered list of steps executed one after another.
///
/// A step advances the chain by calling [`Next::call`]. Dropping the
/// continuation instead halts the chain without error. The value a step
/// returns is what its caller sees, so a step can either forward the rest
/// of the chain's result (`return next.call(args)`) or call the
/// continuation and return its own value.
pub struct Pipeline<'a, A, R> {
    entries: Vec<Option<Step<'a, A, R>>>,
}

impl<'a, A, R> Pipeline<'a, A, R> {
    pub fn new() -> Self {
        Pipeline {
            entries: Vec::new(),
        }
    }

    /// Append a step.
    pub fn then<F>(mut self, step: F) -> Self
    where
        F: FnOnce(Next<'a, A, R>, A) -> Result<Option<R>> + 'a,
    {
        let step: Step<'a, A, R> = Box::new(step);
        self.entries.push(Some(step));
        self
    }

    /// Append an entry that may be missing. Reaching an empty entry fails
    /// with [`NodbError::InvalidStep`].
    pub fn then_maybe(mut self, step: Option<Step<'a, A, R>>) -> Self {
        self.entries.push(step);
        self
    }

    /// Run the chain from its first step with the given arguments.
    pub fn run(self, args: A) -> Result<Option<R>> {
        let next = Next {
            rest: self.entries.into_iter(),
            position: 0,
        };
        next.call(args)
    }
}

impl<'a, A, R> Default for Pipeline<'a, A, R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Continuation handed to each step. Consumed on call, so a step can
/// advance the chain at most once.
pub struct Next<'a, A, R> {
    rest: std::vec::IntoIter<Option<Step<'a, A, R>>>,
    position: usize,
}

impl<'a, A, R> Next<'a, A, R> {
    /// Advance to the next step, forwarding `args`. Past the end of the
    /// chain this returns `Ok(None)`.
    pub fn call(mut self, args: A) -> Result<Option<R>> {
        let position = self.position;
        match self.rest.next() {
            None => Ok(None),
            Some(None) => Err(NodbError::InvalidStep { position }),
            Some(Some(step)) => {
                log::trace!("pipeline step {position}");
                self.position += 1;
                step(self, args)
            }
        }
    }

    /// Position of the step that will run on the next `call`.
    pub fn position(&self) -> usize {
        self.position
    }
}
