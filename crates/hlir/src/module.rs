//! Module attachment, construct creation, and the lowering driver.
//!
//! An `HlirModule` owns the LLVM module the front-end emits into and the
//! ordered list of parallel constructs attached to it. Constructs are
//! auto-named from a process-wide counter (`pfor0`, `reduce1`, `task2`,
//! ...), so names stay unique even across modules, and a process-wide
//! registry rejects attaching twice to the same module name.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::BasicTypeEnum;

use crate::constructs::{HlirParallelFor, HlirParallelReduce, HlirTask};
use crate::diagnostics::{Diagnostic, LowerResult};
use crate::lower;
use crate::runtime_decls::RuntimeDecls;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
static ATTACHED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn next_name(prefix: &str) -> String {
    format!("{}{}", prefix, NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// A construct in creation order. Lowering dispatches on the kind; each
/// kind has its own pass.
enum Construct<'ctx> {
    ParallelFor(Rc<HlirParallelFor<'ctx>>),
    ParallelReduce(Rc<HlirParallelReduce<'ctx>>),
    Task(Rc<HlirTask<'ctx>>),
}

pub struct HlirModule<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    constructs: RefCell<Vec<Construct<'ctx>>>,
}

impl<'ctx> HlirModule<'ctx> {
    /// Takes ownership of `module` and prepares it for parallel
    /// constructs. At most one attach per module name per process.
    pub fn attach(context: &'ctx Context, module: Module<'ctx>) -> LowerResult<Self> {
        let name = module.get_name().to_string_lossy().into_owned();
        let mut attached = ATTACHED
            .get_or_init(|| Mutex::new(HashSet::new()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !attached.insert(name.clone()) {
            return Err(Diagnostic::simple(format!(
                "module '{}' already has parallel constructs attached",
                name
            )));
        }
        drop(attached);
        Ok(HlirModule {
            context,
            module,
            constructs: RefCell::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &'ctx Context {
        self.context
    }

    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    pub fn create_parallel_for(&self) -> LowerResult<Rc<HlirParallelFor<'ctx>>> {
        let pf = Rc::new(HlirParallelFor::build(
            self.context,
            &self.module,
            next_name("pfor"),
        )?);
        self.constructs
            .borrow_mut()
            .push(Construct::ParallelFor(Rc::clone(&pf)));
        Ok(pf)
    }

    pub fn create_parallel_reduce(
        &self,
        reduce_ty: BasicTypeEnum<'ctx>,
    ) -> LowerResult<Rc<HlirParallelReduce<'ctx>>> {
        let r = Rc::new(HlirParallelReduce::build(
            self.context,
            &self.module,
            next_name("reduce"),
            reduce_ty,
        )?);
        self.constructs
            .borrow_mut()
            .push(Construct::ParallelReduce(Rc::clone(&r)));
        Ok(r)
    }

    pub fn create_task(&self) -> Rc<HlirTask<'ctx>> {
        let task = Rc::new(HlirTask::build(next_name("task")));
        self.constructs
            .borrow_mut()
            .push(Construct::Task(Rc::clone(&task)));
        task
    }

    /// Runs the lowering passes over every construct in creation order.
    /// After this returns, no marker or anchor instruction survives and
    /// the module is ordinary IR plus `__strand_*` calls.
    pub fn lower_to_ir(&self) -> LowerResult<()> {
        let decls = RuntimeDecls::declare(self.context, &self.module);
        for construct in self.constructs.borrow().iter() {
            match construct {
                Construct::ParallelFor(pf) => {
                    lower::parallel_for::lower(self.context, &decls, pf)?
                }
                Construct::ParallelReduce(r) => {
                    lower::parallel_reduce::lower(self.context, &self.module, &decls, r)?
                }
                Construct::Task(task) => {
                    lower::task::lower(self.context, &self.module, &decls, task)?
                }
            }
        }
        Ok(())
    }
}
