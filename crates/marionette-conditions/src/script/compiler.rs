use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use marionette_events::ConditionKind;

use super::ast::{Expr, Place, Stmt, StmtKind, SuspendOp};
use super::parser::parse_program;
use crate::error::CompileError;

/// What a unit is bound to, which decides the names it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Receives `packet` along with the entity context
    Packet,
    /// Entity context only
    Periodic,
}

impl From<ConditionKind> for BindingKind {
    fn from(kind: ConditionKind) -> Self {
        if kind.is_packet() {
            BindingKind::Packet
        } else {
            BindingKind::Periodic
        }
    }
}

/// Executable form of a condition's source
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    inner: Arc<UnitInner>,
}

#[derive(Debug)]
struct UnitInner {
    serial: u64,
    binding: BindingKind,
    source: String,
    program: Vec<Stmt>,
    suspension_points: usize,
}

impl CompiledUnit {
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn binding(&self) -> BindingKind {
        self.inner.binding
    }

    /// The text this unit was compiled from
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn program(&self) -> &[Stmt] {
        &self.inner.program
    }

    pub fn suspension_points(&self) -> usize {
        self.inner.suspension_points
    }
}

/// Compiles condition source, counting successful compilations
#[derive(Debug, Default)]
pub struct Compiler {
    compiled: AtomicU64,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `source` and rewrite its blocking calls into suspension points.
    ///
    /// # Errors
    /// Returns a `CompileError` for malformed source or loop control
    /// statements outside of a loop.
    pub fn compile(&self, source: &str, binding: BindingKind) -> Result<CompiledUnit, CompileError> {
        let mut program = parse_program(source)?;
        let mut rewriter = Rewriter::default();
        rewriter.block(&mut program, 0)?;

        let serial = self.compiled.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CompiledUnit {
            inner: Arc::new(UnitInner {
                serial,
                binding,
                source: source.to_string(),
                program,
                suspension_points: rewriter.suspension_points,
            }),
        })
    }

    pub fn compile_count(&self) -> u64 {
        self.compiled.load(Ordering::SeqCst)
    }
}

/// Blocking call sites recognised by name
fn suspend_op(callee: &Expr) -> Option<SuspendOp> {
    let (receiver, name) = match callee {
        Expr::Var(name) => (None, name.as_str()),
        Expr::Field(object, name) => match object.as_ref() {
            Expr::Var(receiver) => (Some(receiver.as_str()), name.as_str()),
            _ => return None,
        },
        _ => return None,
    };

    match (receiver, name) {
        (None | Some("time"), "sleep") => Some(SuspendOp::Sleep),
        (None | Some("player"), "walk_to") => Some(SuspendOp::WalkTo),
        (None | Some("player"), "walk_to_map") => Some(SuspendOp::WalkToMap),
        (None | Some("player"), "queries") => Some(SuspendOp::Queries),
        _ => None,
    }
}

#[derive(Default)]
struct Rewriter {
    suspension_points: usize,
}

impl Rewriter {
    fn block(&mut self, stmts: &mut [Stmt], loop_depth: usize) -> Result<(), CompileError> {
        for stmt in stmts {
            self.stmt(stmt, loop_depth)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &mut Stmt, loop_depth: usize) -> Result<(), CompileError> {
        let line = stmt.line;
        match &mut stmt.kind {
            StmtKind::Assign { place, value, .. } => {
                match place {
                    Place::Var(_) => {}
                    Place::Field(object, _) => self.expr(object),
                    Place::Index(object, index) => {
                        self.expr(object);
                        self.expr(index);
                    }
                }
                self.expr(value);
            }
            StmtKind::Expr(expr) => self.expr(expr),
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (cond, body) in branches {
                    self.expr(cond);
                    self.block(body, loop_depth)?;
                }
                if let Some(body) = otherwise {
                    self.block(body, loop_depth)?;
                }
            }
            StmtKind::While { cond, body } => {
                self.expr(cond);
                self.block(body, loop_depth + 1)?;
            }
            StmtKind::For { iter, body, .. } => {
                self.expr(iter);
                self.block(body, loop_depth + 1)?;
            }
            StmtKind::Break if loop_depth == 0 => {
                return Err(CompileError::MisplacedControl {
                    line,
                    keyword: "break",
                });
            }
            StmtKind::Continue if loop_depth == 0 => {
                return Err(CompileError::MisplacedControl {
                    line,
                    keyword: "continue",
                });
            }
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Nil
            | Expr::Bool(_)
            | Expr::Int(_)
            | Expr::Float(_)
            | Expr::Str(_)
            | Expr::Var(_) => {}
            Expr::List(items) | Expr::Suspend(_, items) => {
                for item in items {
                    self.expr(item);
                }
            }
            Expr::Field(object, _) => self.expr(object),
            Expr::Index(object, index) => {
                self.expr(object);
                self.expr(index);
            }
            Expr::Unary(_, operand) => self.expr(operand),
            Expr::Binary(_, lhs, rhs) => {
                self.expr(lhs);
                self.expr(rhs);
            }
            Expr::Call { callee, args } => {
                for arg in args.iter_mut() {
                    self.expr(arg);
                }
                if let Some(op) = suspend_op(callee) {
                    self.suspension_points += 1;
                    let args = std::mem::take(args);
                    *expr = Expr::Suspend(op, args);
                } else {
                    self.expr(callee);
                }
            }
        }
    }
}
