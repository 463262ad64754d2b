//! Closed-world primitive operations.
//!
//! Each builtin knows three things: its result type for given operand
//! kinds, its C emission, and its host evaluation. Operands are the
//! receiver (if any) followed by the arguments.

use crate::error::{CompileError, Result};
use crate::types::{ConcreteType, UnionType, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn c_symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem
        )
    }

    fn is_bitwise(&self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr
        )
    }

    fn is_ordering(&self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MathFn {
    Sqrt,
    Sin,
    Cos,
    Exp,
    Log,
}

impl MathFn {
    fn c_name(&self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrtf",
            MathFn::Sin => "sinf",
            MathFn::Cos => "cosf",
            MathFn::Exp => "expf",
            MathFn::Log => "logf",
        }
    }

    fn apply(&self, x: f32) -> f32 {
        match self {
            MathFn::Sqrt => x.sqrt(),
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Exp => x.exp(),
            MathFn::Log => x.ln(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Builtin {
    Binary(BinaryOp),
    Not,
    Neg,
    ToFloat,
    ToInt,
    Abs,
    ArrayIndex,
    ArraySize,
    StructIndex,
    Math(MathFn),
    Min,
    Max,
}

/// Method selectors available on a primitive, array, or struct kind.
pub(super) fn primitive_methods(ty: &ConcreteType) -> Vec<(&'static str, Builtin)> {
    use BinaryOp::*;
    use Builtin::*;
    let comparisons = [("==", Binary(Eq)), ("!=", Binary(Ne)), ("!", Not)];
    match ty {
        ConcreteType::Int | ConcreteType::Float => {
            let mut methods = vec![
                ("+", Binary(Add)),
                ("-", Binary(Sub)),
                ("*", Binary(Mul)),
                ("/", Binary(Div)),
                ("%", Binary(Rem)),
                ("<", Binary(Lt)),
                ("<=", Binary(Le)),
                (">", Binary(Gt)),
                (">=", Binary(Ge)),
                ("-@", Neg),
                ("to_f", ToFloat),
                ("to_i", ToInt),
                ("abs", Abs),
            ];
            if *ty == ConcreteType::Int {
                methods.extend([
                    ("&", Binary(BitAnd)),
                    ("|", Binary(BitOr)),
                    ("^", Binary(BitXor)),
                    ("<<", Binary(Shl)),
                    (">>", Binary(Shr)),
                ]);
            }
            methods.extend(comparisons);
            methods
        }
        ConcreteType::Bool => {
            let mut methods = vec![
                ("&", Binary(And)),
                ("&&", Binary(And)),
                ("|", Binary(Or)),
                ("||", Binary(Or)),
                ("^", Binary(Ne)),
            ];
            methods.extend(comparisons);
            methods
        }
        ConcreteType::Void => comparisons.to_vec(),
        ConcreteType::Array(_) => vec![("[]", ArrayIndex), ("size", ArraySize), ("length", ArraySize)],
        ConcreteType::Struct(_) => vec![("[]", StructIndex)],
        ConcreteType::Class(_) => Vec::new(),
    }
}

/// Functions callable without a receiver.
pub(super) fn free_functions() -> Vec<(&'static str, Builtin)> {
    vec![
        ("sqrt", Builtin::Math(MathFn::Sqrt)),
        ("sin", Builtin::Math(MathFn::Sin)),
        ("cos", Builtin::Math(MathFn::Cos)),
        ("exp", Builtin::Math(MathFn::Exp)),
        ("log", Builtin::Math(MathFn::Log)),
        ("abs", Builtin::Abs),
        ("min", Builtin::Min),
        ("max", Builtin::Max),
        ("float", Builtin::ToFloat),
        ("int", Builtin::ToInt),
    ]
}

fn numeric_result(a: &ConcreteType, b: &ConcreteType) -> UnionType {
    if *a == ConcreteType::Int && *b == ConcreteType::Int {
        UnionType::int()
    } else {
        UnionType::float()
    }
}

fn expect(ok: bool, what: &str, got: &ConcreteType) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(CompileError::type_error(format!("{} expects {}, got {}", what, what_kind(what), got)))
    }
}

fn what_kind(what: &str) -> &'static str {
    match what {
        "bitwise operator" => "int operands",
        "logical operator" => "bool operands",
        "equality" => "primitive operands",
        "index" => "an int index",
        _ => "numeric operands",
    }
}

impl Builtin {
    /// Number of operands, counting the receiver.
    pub fn operand_count(&self) -> usize {
        match self {
            Builtin::Binary(_) | Builtin::ArrayIndex | Builtin::StructIndex => 2,
            Builtin::Min | Builtin::Max => 2,
            _ => 1,
        }
    }

    /// Result type for singleton operand kinds. `literal_index` is the value of
    /// the index operand when it is an integer literal.
    pub fn result_type(
        &self,
        operands: &[ConcreteType],
        literal_index: Option<i64>,
    ) -> Result<UnionType> {
        if operands.len() != self.operand_count() {
            return Err(CompileError::type_error(format!(
                "wrong number of arguments ({} for {})",
                operands.len().saturating_sub(1),
                self.operand_count() - 1
            )));
        }
        let a = &operands[0];
        match self {
            Builtin::Binary(op) => {
                let b = &operands[1];
                if op.is_arithmetic() {
                    expect(a.is_numeric(), "arithmetic", a)?;
                    expect(b.is_numeric(), "arithmetic", b)?;
                    Ok(numeric_result(a, b))
                } else if op.is_bitwise() {
                    expect(*a == ConcreteType::Int, "bitwise operator", a)?;
                    expect(*b == ConcreteType::Int, "bitwise operator", b)?;
                    Ok(UnionType::int())
                } else if op.is_ordering() {
                    expect(a.is_numeric(), "comparison", a)?;
                    expect(b.is_numeric(), "comparison", b)?;
                    Ok(UnionType::bool())
                } else if matches!(op, BinaryOp::And | BinaryOp::Or) {
                    expect(*a == ConcreteType::Bool, "logical operator", a)?;
                    expect(*b == ConcreteType::Bool, "logical operator", b)?;
                    Ok(UnionType::bool())
                } else {
                    expect(a.is_primitive(), "equality", a)?;
                    expect(b.is_primitive(), "equality", b)?;
                    Ok(UnionType::bool())
                }
            }
            Builtin::Not => {
                expect(a.is_primitive(), "equality", a)?;
                Ok(UnionType::bool())
            }
            Builtin::Neg | Builtin::Abs => {
                expect(a.is_numeric(), "arithmetic", a)?;
                Ok(UnionType::of(a.clone()))
            }
            Builtin::ToFloat | Builtin::Math(_) => {
                expect(a.is_numeric(), "conversion", a)?;
                Ok(UnionType::float())
            }
            Builtin::ToInt => {
                expect(a.is_numeric(), "conversion", a)?;
                Ok(UnionType::int())
            }
            Builtin::Min | Builtin::Max => {
                let b = &operands[1];
                expect(a.is_numeric(), "comparison", a)?;
                expect(b.is_numeric(), "comparison", b)?;
                Ok(numeric_result(a, b))
            }
            Builtin::ArrayIndex => {
                expect(operands[1] == ConcreteType::Int, "index", &operands[1])?;
                match a {
                    ConcreteType::Array(elem) => Ok((**elem).clone()),
                    other => Err(CompileError::type_error(format!("{} is not an array", other))),
                }
            }
            Builtin::ArraySize => Ok(UnionType::int()),
            Builtin::StructIndex => {
                expect(operands[1] == ConcreteType::Int, "index", &operands[1])?;
                let ConcreteType::Struct(fields) = a else {
                    return Err(CompileError::type_error(format!("{} is not a struct", a)));
                };
                match literal_index {
                    Some(k) => struct_field_index(fields.len(), k)
                        .map(|i| fields[i].clone())
                        .ok_or_else(|| {
                            CompileError::type_error(format!(
                                "index {} out of range for {}",
                                k, a
                            ))
                        }),
                    None => match fields.first() {
                        Some(first) if fields.iter().all(|f| f == first) => Ok(first.clone()),
                        _ => Err(CompileError::type_error(format!(
                            "fields of {} differ in type; index it with a literal",
                            a
                        ))),
                    },
                }
            }
        }
    }

    /// C expression for this builtin over already emitted operands.
    pub fn emit(&self, operands: &[String], types: &[ConcreteType]) -> String {
        let a = operands.first().map(String::as_str).unwrap_or("0");
        let b = operands.get(1).map(String::as_str).unwrap_or("0");
        let any_float = types.iter().any(|t| *t == ConcreteType::Float);
        match self {
            Builtin::Binary(BinaryOp::Rem) if any_float => {
                format!("fmodf((float) {}, (float) {})", a, b)
            }
            Builtin::Binary(op) => format!("({} {} {})", a, op.c_symbol(), b),
            Builtin::Not => match types.first() {
                Some(ConcreteType::Bool) => format!("(!{})", a),
                Some(ConcreteType::Void) => "true".to_string(),
                _ => "false".to_string(),
            },
            Builtin::Neg => format!("(-{})", a),
            Builtin::ToFloat => format!("((float) {})", a),
            Builtin::ToInt => format!("((int) {})", a),
            Builtin::Abs if any_float => format!("fabsf({})", a),
            Builtin::Abs => format!("abs({})", a),
            Builtin::Math(f) => format!("{}((float) {})", f.c_name(), a),
            Builtin::Min if any_float => format!("fminf((float) {}, (float) {})", a, b),
            Builtin::Max if any_float => format!("fmaxf((float) {}, (float) {})", a, b),
            Builtin::Min => format!("min({}, {})", a, b),
            Builtin::Max => format!("max({}, {})", a, b),
            Builtin::ArrayIndex => format!("{}[{}]", a, b),
            Builtin::ArraySize => "0".to_string(),
            Builtin::StructIndex => format!("({}).field_{}", a, b),
        }
    }

    /// Host evaluation with device semantics (wrapping ints, truncating division).
    pub fn eval(&self, operands: &[Value]) -> Result<Value> {
        let a = operands
            .first()
            .ok_or_else(|| CompileError::evaluation("missing receiver"))?;
        let b = operands.get(1);
        let second = || b.ok_or_else(|| CompileError::evaluation("missing argument"));
        match self {
            Builtin::Binary(op) => eval_binary(*op, a, second()?),
            Builtin::Not => Ok(Value::Bool(!a.truthy())),
            Builtin::Neg => match a {
                Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
                Value::Float(v) => Ok(Value::Float(-v)),
                other => Err(not_numeric(other)),
            },
            Builtin::Abs => match a {
                Value::Int(v) => Ok(Value::Int(v.wrapping_abs())),
                Value::Float(v) => Ok(Value::Float(v.abs())),
                other => Err(not_numeric(other)),
            },
            Builtin::ToFloat => a.as_f32().map(Value::Float).ok_or_else(|| not_numeric(a)),
            Builtin::ToInt => match a {
                Value::Int(v) => Ok(Value::Int(*v)),
                Value::Float(v) => Ok(Value::Int(*v as i32)),
                other => Err(not_numeric(other)),
            },
            Builtin::Math(f) => a
                .as_f32()
                .map(|x| Value::Float(f.apply(x)))
                .ok_or_else(|| not_numeric(a)),
            Builtin::Min | Builtin::Max => {
                let b = second()?;
                let pick_min = *self == Builtin::Min;
                match (a, b) {
                    (Value::Int(x), Value::Int(y)) => {
                        Ok(Value::Int(if pick_min { *x.min(y) } else { *x.max(y) }))
                    }
                    _ => {
                        let x = a.as_f32().ok_or_else(|| not_numeric(a))?;
                        let y = b.as_f32().ok_or_else(|| not_numeric(b))?;
                        Ok(Value::Float(if pick_min { x.min(y) } else { x.max(y) }))
                    }
                }
            }
            Builtin::ArrayIndex | Builtin::StructIndex => {
                let (Value::Array(items) | Value::Struct(items)) = a else {
                    return Err(CompileError::evaluation(format!("cannot index {}", a)));
                };
                let index = second()?
                    .as_int()
                    .ok_or_else(|| CompileError::evaluation("index must be an int"))?;
                struct_field_index(items.len(), i64::from(index))
                    .map(|i| items[i].clone())
                    .ok_or_else(|| {
                        CompileError::evaluation(format!(
                            "index {} out of bounds for {} elements",
                            index,
                            items.len()
                        ))
                    })
            }
            Builtin::ArraySize => match a {
                Value::Array(items) => Ok(Value::Int(items.len() as i32)),
                other => Err(CompileError::evaluation(format!("{} has no size", other))),
            },
        }
    }
}

/// Ruby-style index: negative values count from the end.
fn struct_field_index(len: usize, index: i64) -> Option<usize> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    if resolved >= 0 && (resolved as usize) < len {
        Some(resolved as usize)
    } else {
        None
    }
}

fn not_numeric(v: &Value) -> CompileError {
    CompileError::evaluation(format!("{} is not a number", v))
}

fn eval_binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value> {
    use BinaryOp::*;
    match (op, a, b) {
        (Add, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
        (Sub, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_sub(*y))),
        (Mul, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_mul(*y))),
        (Div | Rem, Value::Int(_), Value::Int(0)) => {
            Err(CompileError::evaluation("integer division by zero"))
        }
        (Div, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_div(*y))),
        (Rem, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_rem(*y))),
        (BitAnd, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x & y)),
        (BitOr, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x | y)),
        (BitXor, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x ^ y)),
        (Shl, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_shl(*y as u32))),
        (Shr, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_shr(*y as u32))),
        (And, Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(*x && *y)),
        (Or, Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(*x || *y)),
        (Add | Sub | Mul | Div | Rem, _, _) => {
            let x = a.as_f32().ok_or_else(|| not_numeric(a))?;
            let y = b.as_f32().ok_or_else(|| not_numeric(b))?;
            Ok(Value::Float(match op {
                Add => x + y,
                Sub => x - y,
                Mul => x * y,
                Div => x / y,
                _ => x % y,
            }))
        }
        (Lt | Le | Gt | Ge, Value::Int(x), Value::Int(y)) => Ok(Value::Bool(match op {
            Lt => x < y,
            Le => x <= y,
            Gt => x > y,
            _ => x >= y,
        })),
        (Lt | Le | Gt | Ge, _, _) => {
            let x = a.as_f32().ok_or_else(|| not_numeric(a))?;
            let y = b.as_f32().ok_or_else(|| not_numeric(b))?;
            Ok(Value::Bool(match op {
                Lt => x < y,
                Le => x <= y,
                Gt => x > y,
                _ => x >= y,
            }))
        }
        (Eq | Ne, _, _) => {
            let equal = match (a.as_f32(), b.as_f32()) {
                (Some(x), Some(y)) if a.as_int().is_none() || b.as_int().is_none() => x == y,
                _ => a == b,
            };
            Ok(Value::Bool(if op == Eq { equal } else { !equal }))
        }
        _ => Err(CompileError::evaluation(format!(
            "operator {} is not defined for {} and {}",
            op.c_symbol(),
            a,
            b
        ))),
    }
}
