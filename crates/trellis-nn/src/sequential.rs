// Layers: a chain of modules applied one after another
//
// Example:
//   let mut net = Layers::new("lenet")
//       .add(ConvolutionLayer::new("c0", (5, 5), (1, 1), table, None)?)
//       .add(SubsamplingModule::new("s1", 6, (2, 2), None)?)
//       .add(FullLayer::new("f2", 6 * 14 * 14, 10, None)?);
//
// The chain owns the intermediate states between its members. fprop runs
// front to back; bprop and bbprop run back to front and prepare (allocate
// and zero) each intermediate derivative before the member that writes it.
// The derivatives of the chain's own input are still the caller's to
// prepare.

use trellis_core::{bail, ops, Result, Shape, Tensor};

use crate::forget::ForgetParam;
use crate::module::{expect_weights, resize_output, Module};
use crate::state::State;
use crate::Element;

/// A container that chains modules sequentially.
///
/// Layers itself implements Module, so it can be nested.
pub struct Layers<T: Element> {
    name: String,
    modules: Vec<Box<dyn Module<T>>>,
    hidden: Vec<State<T>>,
}

impl<T: Element> Layers<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Layers {
            name: name.into(),
            modules: Vec::new(),
            hidden: Vec::new(),
        }
    }

    /// Append a module. Returns self for chaining.
    #[allow(clippy::should_implement_trait)]
    pub fn add<M: Module<T> + 'static>(mut self, module: M) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    pub fn push(&mut self, module: Box<dyn Module<T>>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn modules(&self) -> &[Box<dyn Module<T>>] {
        &self.modules
    }

    /// Output of member `i` (for every member but the last).
    pub fn hidden(&self, i: usize) -> Option<&State<T>> {
        self.hidden.get(i)
    }

    fn ensure_hidden(&mut self) -> Result<()> {
        let needed = self.modules.len().saturating_sub(1);
        while self.hidden.len() < needed {
            self.hidden.push(State::new(1)?);
        }
        self.hidden.truncate(needed);
        Ok(())
    }

    fn backward(&mut self, input: &mut State<T>, output: &State<T>, second: bool) -> Result<()> {
        let n = self.modules.len();
        if n == 0 {
            return if second {
                ops::add_acc(output.ddx()?, input.ddx()?)
            } else {
                ops::add_acc(output.dx()?, input.dx()?)
            };
        }
        // hidden states exist only once fprop has run over the current members
        if self.hidden.len() != n - 1 {
            bail!(
                "layers {}: {} called before fprop",
                self.name,
                if second { "bbprop" } else { "bprop" }
            );
        }
        for i in (0..n).rev() {
            let (before, after) = self.hidden.split_at_mut(i);
            let dst: &State<T> = if i == n - 1 { output } else { &after[0] };
            let src: &mut State<T> = if i == 0 { &mut *input } else { &mut before[i - 1] };
            if i > 0 {
                if second {
                    src.prepare_ddx()?;
                } else {
                    src.prepare_dx()?;
                }
            }
            let m = &mut self.modules[i];
            if second {
                m.bbprop(src, dst)?;
            } else {
                m.bprop(src, dst)?;
            }
        }
        Ok(())
    }
}

impl<T: Element> Module<T> for Layers<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn fprop(&mut self, input: &State<T>, output: &mut State<T>) -> Result<()> {
        let n = self.modules.len();
        if n == 0 {
            resize_output(&self.name, output, input.shape().clone())?;
            return ops::copy(input.x(), output.x());
        }
        self.ensure_hidden()?;
        for (i, m) in self.modules.iter_mut().enumerate() {
            let (before, after) = self.hidden.split_at_mut(i);
            let src: &State<T> = if i == 0 { input } else { &before[i - 1] };
            let dst: &mut State<T> = if i == n - 1 { &mut *output } else { &mut after[0] };
            m.fprop(src, dst)?;
        }
        Ok(())
    }

    fn bprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.backward(input, output, false)
    }

    fn bbprop(&mut self, input: &mut State<T>, output: &State<T>) -> Result<()> {
        self.backward(input, output, true)
    }

    fn forget(&mut self, fp: &mut ForgetParam) -> Result<()> {
        for m in self.modules.iter_mut() {
            m.forget(fp)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let mut s = format!("layers {}:", self.name);
        for m in &self.modules {
            s.push_str("\n  ");
            s.push_str(&m.describe());
        }
        s
    }

    fn fprop_size(&self, input: &Shape) -> Result<Shape> {
        self.modules
            .iter()
            .try_fold(input.clone(), |shape, m| m.fprop_size(&shape))
    }

    fn bprop_size(&self, output: &Shape) -> Result<Shape> {
        self.modules
            .iter()
            .rev()
            .try_fold(output.clone(), |shape, m| m.bprop_size(&shape))
    }

    fn parameters(&self) -> Vec<&State<T>> {
        self.modules.iter().flat_map(|m| m.parameters()).collect()
    }

    /// One tensor per parameter, in member order.
    fn load_x(&mut self, weights: &[Tensor<T>]) -> Result<()> {
        expect_weights(&self.name, weights, self.parameters().len())?;
        let mut rest = weights;
        for m in self.modules.iter_mut() {
            let (mine, tail) = rest.split_at(m.parameters().len());
            m.load_x(mine)?;
            rest = tail;
        }
        Ok(())
    }
}
