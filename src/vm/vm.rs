use std::io::{self, Write};
use std::rc::Rc;

use log::{debug, trace};

use super::{Frame, GcStats, GenerationalHeap, Intrinsic, ObjRef, Value};
use crate::config::RuntimeConfig;
use crate::error::{Fault, OperandFault, VmError};
use crate::il::{decode, Instruction, OpCode, Verifier};
use crate::metadata::{ExceptionRegion, MemberRef, MethodSignature, RegionKind, Token, TokenKind};
use crate::program::LoadedProgram;

/// What the frame loop does after an instruction.
enum Flow {
    Next,
    Jump(usize),
    Return(Option<Value>),
}

/// The interpreter.
///
/// Each managed call is a native call to [`Vm::invoke`]; the frames of all
/// in-flight calls are kept in `frames` so a collection can see every root.
pub struct Vm {
    heap: GenerationalHeap,
    frames: Vec<Frame>,
    config: RuntimeConfig,
    /// Output stream for the console intrinsics
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::new_with_config(RuntimeConfig::default(), Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        Self::new_with_config(RuntimeConfig::default(), output)
    }

    pub fn new_with_config(config: RuntimeConfig, output: Box<dyn Write>) -> Self {
        Self {
            heap: GenerationalHeap::new(),
            frames: Vec::with_capacity(64),
            config,
            output,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &GenerationalHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut GenerationalHeap {
        &mut self.heap
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.heap.stats()
    }

    /// Number of managed calls currently in flight.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Run the program's entry point and turn its result into an exit code.
    pub fn execute_entry_point(&mut self, program: &mut LoadedProgram) -> Result<i32, VmError> {
        self.execute_entry_point_with_args(program, &[])
    }

    /// Like [`Vm::execute_entry_point`], handing `args` to an entry point
    /// that takes a string list. Non-integer results exit with 0.
    pub fn execute_entry_point_with_args(
        &mut self,
        program: &mut LoadedProgram,
        args: &[String],
    ) -> Result<i32, VmError> {
        let entry_args = match program.entry_signature().param_count {
            0 => Vec::new(),
            _ => vec![Value::StrList(args.iter().map(|a| Rc::from(a.as_str())).collect())],
        };
        let entry_point = program.entry_point();
        let result = self.invoke(program, entry_point, entry_args)?;
        self.output.flush()?;
        Ok(result.and_then(|v| v.as_int()).unwrap_or(0))
    }

    /// Run `method` with `args` (receiver first for instance methods) to
    /// completion.
    pub fn invoke(
        &mut self,
        program: &mut LoadedProgram,
        method: Token,
        args: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        let info = program.cache().method_info(method)?;
        let signature = info.signature;
        if args.len() != signature.arg_count() {
            return Err(VmError::ArityMismatch {
                method: info.name.clone(),
                expected: signature.arg_count(),
                actual: args.len(),
            });
        }
        if self.frames.len() >= self.config.max_call_depth {
            return Err(VmError::StackOverflow(self.config.max_call_depth));
        }
        debug!("invoke {} {} (depth {})", method, info.name, self.frames.len());

        let frame = self.load_frame(program, method, signature, args)?;
        self.frames.push(frame);
        let result = self.run_frame(program);
        self.frames.pop();
        result
    }

    /// Decode (and optionally verify) `method`'s body into a fresh frame.
    #[inline(never)]
    fn load_frame(
        &self,
        program: &LoadedProgram,
        method: Token,
        signature: MethodSignature,
        args: Vec<Value>,
    ) -> Result<Frame, VmError> {
        let body = program.provider().method_body(method)?;
        let instructions = decode(&body.code)?;
        if self.config.verify_bodies {
            Verifier::new(signature.arg_count(), body.local_count).verify(&instructions, &body.regions)?;
        }
        Ok(Frame::new(method, instructions, body.regions, args, body.local_count))
    }

    fn run_frame(&mut self, program: &mut LoadedProgram) -> Result<Option<Value>, VmError> {
        let depth = self.frames.len() - 1;
        loop {
            let frame = &self.frames[depth];
            let Some(&instr) = frame.instructions.get(frame.ip) else {
                // fell off the end of the body
                return Ok(None);
            };
            trace!("{}", instr);

            // Calls recurse into `invoke`; keep `step` off the recursive path.
            let flow = match instr.opcode {
                OpCode::Call => token_operand(&instr).and_then(|t| self.call(program, depth, t)),
                OpCode::Callvirt => token_operand(&instr).and_then(|t| self.callvirt(program, depth, t)),
                OpCode::Newobj => token_operand(&instr).and_then(|t| self.newobj(program, depth, t)),
                _ => self.step(program, depth, instr),
            };
            match flow {
                Ok(Flow::Next) => self.frames[depth].ip += 1,
                Ok(Flow::Jump(index)) => self.frames[depth].ip = index,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(err) => {
                    let handler = self.handle_fault(program, depth, instr.offset, err)?;
                    self.frames[depth].ip = handler;
                }
            }
        }
    }

    #[inline(never)]
    fn step(&mut self, program: &LoadedProgram, depth: usize, instr: Instruction) -> Result<Flow, VmError> {
        let frame = &mut self.frames[depth];
        match instr.opcode {
            OpCode::Nop | OpCode::Endfinally => {}

            OpCode::Ldarg => {
                let value = frame.arg(index_operand(&instr)?)?.clone();
                frame.push(value);
            }
            OpCode::Starg => {
                let value = frame.pop()?;
                *frame.arg(index_operand(&instr)?)? = value;
            }
            OpCode::Ldloc => {
                let value = frame.local(index_operand(&instr)?)?.clone();
                frame.push(value);
            }
            OpCode::Stloc => {
                let value = frame.pop()?;
                *frame.local(index_operand(&instr)?)? = value;
            }

            OpCode::Ldnull => frame.push(Value::Null),
            OpCode::LdcI4 => {
                let n = instr.int().ok_or_else(|| missing_operand(&instr))?;
                frame.push(Value::Int(n));
            }
            OpCode::Ldstr => {
                let text = program.provider().user_string(token_operand(&instr)?)?;
                frame.push(Value::str(&text));
            }
            OpCode::Dup => {
                let value = frame.peek()?.clone();
                frame.push(value);
            }
            OpCode::Pop => {
                frame.pop()?;
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Rem => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                let result = arithmetic(instr.opcode, to_int(&a)?, to_int(&b)?)?;
                frame.push(Value::Int(result));
            }
            OpCode::Neg => {
                let a = frame.pop()?;
                frame.push(Value::Int(to_int(&a)?.wrapping_neg()));
            }
            OpCode::Ceq | OpCode::Cgt | OpCode::Clt => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                let result = compare(instr.opcode, &a, &b)?;
                frame.push(Value::Int(i32::from(result)));
            }

            OpCode::Br => return Ok(Flow::Jump(frame.index_of(target_operand(&instr)?)?)),
            OpCode::Brfalse | OpCode::Brtrue => {
                let condition = frame.pop()?;
                if condition.is_truthy() == (instr.opcode == OpCode::Brtrue) {
                    return Ok(Flow::Jump(frame.index_of(target_operand(&instr)?)?));
                }
            }
            OpCode::Beq | OpCode::Bge | OpCode::Bgt | OpCode::Ble | OpCode::Blt | OpCode::BneUn => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                if compare(instr.opcode, &a, &b)? {
                    return Ok(Flow::Jump(frame.index_of(target_operand(&instr)?)?));
                }
            }
            OpCode::Leave => {
                let index = frame.index_of(target_operand(&instr)?)?;
                frame.stack.clear();
                return Ok(Flow::Jump(index));
            }

            OpCode::Ldfld => {
                let key = program.cache().field_key(program.provider(), token_operand(&instr)?)?;
                let instance = frame.pop()?;
                let obj = require_object(&instance, "ldfld")?;
                let value = self.heap.read_field(obj, &key)?;
                frame.push(value);
            }
            OpCode::Stfld => {
                let key = program.cache().field_key(program.provider(), token_operand(&instr)?)?;
                let value = frame.pop()?;
                let instance = frame.pop()?;
                let obj = require_object(&instance, "stfld")?;
                self.heap.write_field(obj, &key, value)?;
            }

            OpCode::Newobj | OpCode::Call | OpCode::Callvirt => {
                return Err(VmError::MalformedBody(format!(
                    "{} at IL_{:04X} reached the instruction stepper",
                    instr.opcode.name(),
                    instr.offset
                )));
            }

            OpCode::Throw => {
                let thrown = frame.pop()?;
                return Err(self.raise(program, thrown));
            }
            OpCode::Ret => {
                let value = frame.stack.pop();
                if self.config.gc_enabled {
                    self.collect_minor(value.as_ref());
                }
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }

    fn push_result(&mut self, depth: usize, signature: MethodSignature, result: Option<Value>) {
        if !signature.returns_void {
            self.frames[depth].push(result.unwrap_or_default());
        }
    }

    fn call(&mut self, program: &mut LoadedProgram, depth: usize, token: Token) -> Result<Flow, VmError> {
        match token.kind() {
            TokenKind::MethodDef => {
                let signature = program.cache().method_info(token)?.signature;
                let args = self.frames[depth].pop_args(signature.arg_count())?;
                let result = self.invoke(program, token, args)?;
                self.push_result(depth, signature, result);
            }
            TokenKind::MemberRef => {
                let member = program.provider().member_ref(token)?;
                let signature = method_signature(program, &member)?;
                let args = self.frames[depth].pop_args(signature.arg_count())?;
                let intrinsic = intrinsic_for(program, &member)?
                    .ok_or_else(|| VmError::UnsupportedCall(member_label(program, &member)))?;
                let result = self.call_intrinsic(intrinsic, &args)?;
                self.push_result(depth, signature, Some(result));
            }
            _ => return Err(VmError::UnsupportedCall(format!("call target {}", token))),
        }
        Ok(Flow::Next)
    }

    fn callvirt(&mut self, program: &mut LoadedProgram, depth: usize, token: Token) -> Result<Flow, VmError> {
        let (name, signature, member) = match token.kind() {
            TokenKind::MethodDef => {
                let info = program.cache().method_info(token)?;
                if !info.signature.is_instance {
                    return self.call(program, depth, token);
                }
                (info.name.clone(), info.signature, None)
            }
            TokenKind::MemberRef => {
                let member = program.provider().member_ref(token)?;
                let signature = method_signature(program, &member)?;
                (member.name.clone(), signature, Some(member))
            }
            _ => return Err(VmError::UnsupportedCall(format!("callvirt target {}", token))),
        };

        let args = self.frames[depth].pop_args(signature.arg_count())?;
        let receiver = match args.first() {
            Some(receiver) if !receiver.is_null() => receiver.clone(),
            _ => return Err(VmError::NullReference(format!("callvirt {} on null instance", name))),
        };

        if let Some(member) = &member
            && let Some(intrinsic) = intrinsic_for(program, member)?
        {
            let result = self.call_intrinsic(intrinsic, &args)?;
            self.push_result(depth, signature, Some(result));
            return Ok(Flow::Next);
        }

        let Value::Object(receiver) = receiver else {
            return Err(VmError::UnsupportedCall(format!(
                "callvirt {} on a {} receiver",
                name,
                receiver.kind_name()
            )));
        };
        let target = self.resolve_virtual(program, token, receiver, &name, signature.param_count)?;
        let result = self.invoke(program, target, args)?;
        self.push_result(depth, signature, result);
        Ok(Flow::Next)
    }

    /// Runtime-type dispatch through the program's dispatch cache.
    fn resolve_virtual(
        &self,
        program: &mut LoadedProgram,
        site: Token,
        receiver: ObjRef,
        name: &str,
        param_count: usize,
    ) -> Result<Token, VmError> {
        let obj = self.heap.object(receiver)?;
        let runtime_type = obj.type_token;
        if let Some(target) = program.dispatch_mut().lookup(site, runtime_type) {
            return Ok(target);
        }

        let target = program
            .cache()
            .resolve_virtual(runtime_type, name, param_count)
            .ok_or_else(|| {
                VmError::MissingMethod(format!(
                    "virtual target not found: {}::{}({})",
                    obj.type_name, name, param_count
                ))
            })?;
        debug!("dispatch {} on {} resolved to {}", site, obj.type_name, target);
        program.dispatch_mut().insert(site, runtime_type, target);
        Ok(target)
    }

    fn newobj(&mut self, program: &mut LoadedProgram, depth: usize, token: Token) -> Result<Flow, VmError> {
        let (ctor, ty) = program.cache().resolve_constructor(program.provider(), token)?;
        let signature = program.cache().method_info(ctor)?.signature;
        let type_name = program.cache().type_name(program.provider(), ty)?;
        let instance = self.heap.allocate(ty, &type_name, program.cache().field_keys_of(ty));

        let ctor_args = self.frames[depth].pop_args(signature.param_count)?;
        // The caller's stack roots the instance while the constructor runs,
        // even if the constructor overwrites `this`.
        self.frames[depth].push(Value::Object(instance));
        let mut args = Vec::with_capacity(ctor_args.len() + 1);
        args.push(Value::Object(instance));
        args.extend(ctor_args);
        self.invoke(program, ctor, args)?;
        Ok(Flow::Next)
    }

    fn call_intrinsic(&mut self, intrinsic: Intrinsic, args: &[Value]) -> Result<Value, VmError> {
        trace!("intrinsic {} with {} args", intrinsic.name(), args.len());
        match intrinsic {
            Intrinsic::WriteLine => {
                let line = match args {
                    [] => String::new(),
                    [single] => self.text_of(single),
                    many => many.iter().map(|v| self.text_of(v)).collect::<Vec<_>>().join(" "),
                };
                writeln!(self.output, "{}", line)?;
                Ok(Value::Null)
            }
            Intrinsic::Concat => {
                let text: String = args.iter().map(|v| self.text_of(v)).collect();
                Ok(Value::str(&text))
            }
        }
    }

    /// Text conversion used by the intrinsics. Null is empty, objects print
    /// their type name.
    pub fn text_of(&self, value: &Value) -> String {
        match value {
            Value::Object(r) => match self.heap.get(*r) {
                Some(obj) => obj.type_name.to_string(),
                None => format!("{:?}", r),
            },
            other => other.to_string(),
        }
    }

    /// Turn a thrown value into a fault.
    fn raise(&self, program: &LoadedProgram, thrown: Value) -> VmError {
        match thrown {
            Value::Fault(fault) => VmError::Thrown(fault),
            Value::Null => VmError::NullReference("throw null".to_string()),
            Value::Object(r) => match self.heap.object(r) {
                Ok(obj) => {
                    let ancestry = program.cache().ancestry(obj.type_token);
                    VmError::Thrown(Rc::new(Fault::for_object(ancestry, r)))
                }
                Err(err) => err,
            },
            other => VmError::Thrown(Rc::new(Fault::builtin("System.Exception", self.text_of(&other)))),
        }
    }

    /// Find a catch region of the frame at `depth` for a fault raised at
    /// `offset`, narrowest try first. On a match the operand stack holds only
    /// the fault and the handler's instruction index is returned; otherwise
    /// `err` is handed back unchanged.
    fn handle_fault(
        &mut self,
        program: &LoadedProgram,
        depth: usize,
        offset: u32,
        err: VmError,
    ) -> Result<usize, VmError> {
        let Some(fault) = err.to_fault() else {
            return Err(err);
        };

        let mut candidates: Vec<ExceptionRegion> = self.frames[depth]
            .regions
            .iter()
            .filter(|region| region.kind == RegionKind::Catch && region.covers(offset))
            .copied()
            .collect();
        candidates.sort_by_key(|region| region.try_length);

        for region in candidates {
            let matches = match region.catch_type {
                Some(token) if token.index().is_some() => {
                    let catch_name = program.cache().type_name(program.provider(), token)?;
                    fault.is_instance_of(&catch_name)
                }
                _ => true,
            };
            if !matches {
                continue;
            }

            let frame = &mut self.frames[depth];
            let handler = frame.index_of(region.handler_offset)?;
            debug!(
                "{} at IL_{:04X} caught by handler IL_{:04X}",
                fault.type_name, offset, region.handler_offset
            );
            let payload = fault.payload;
            let value = match payload {
                Some(r) => Value::Object(r),
                None => Value::Fault(fault),
            };
            frame.stack.clear();
            frame.push(value);
            return Ok(handler);
        }

        debug!("{} unwinds out of {}", fault.type_name, self.frames[depth].method);
        Err(err)
    }

    /// Minor collection rooted in every live frame plus `extra`.
    fn collect_minor(&mut self, extra: Option<&Value>) {
        let roots: Vec<Value> = self
            .frames
            .iter()
            .flat_map(Frame::roots)
            .chain(extra)
            .cloned()
            .collect();
        self.heap.collect_minor(&roots);
    }

    /// Full collection rooted in every live frame.
    pub fn collect_major(&mut self) {
        let roots: Vec<Value> = self.frames.iter().flat_map(Frame::roots).cloned().collect();
        self.heap.collect_major(&roots);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_operand(instr: &Instruction) -> VmError {
    VmError::MalformedBody(format!(
        "{} at IL_{:04X} has no operand",
        instr.opcode.name(),
        instr.offset
    ))
}

fn token_operand(instr: &Instruction) -> Result<Token, VmError> {
    instr.token().ok_or_else(|| missing_operand(instr))
}

fn target_operand(instr: &Instruction) -> Result<u32, VmError> {
    instr.target().ok_or_else(|| missing_operand(instr))
}

fn index_operand(instr: &Instruction) -> Result<usize, VmError> {
    instr.index().ok_or_else(|| missing_operand(instr))
}

fn require_object(value: &Value, what: &str) -> Result<ObjRef, VmError> {
    value
        .as_object()
        .ok_or_else(|| VmError::NullReference(format!("{} on a {} value", what, value.kind_name())))
}

/// Coerce to a 32-bit integer. Null reads as zero.
fn to_int(value: &Value) -> Result<i32, VmError> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Null => Ok(0),
        other => Err(VmError::InvalidOperand {
            fault: OperandFault::InvalidCast,
            detail: format!("cannot convert {} to int32", other.kind_name()),
        }),
    }
}

fn arithmetic(opcode: OpCode, a: i32, b: i32) -> Result<i32, VmError> {
    let checked = match opcode {
        OpCode::Add => return Ok(a.wrapping_add(b)),
        OpCode::Sub => return Ok(a.wrapping_sub(b)),
        OpCode::Mul => return Ok(a.wrapping_mul(b)),
        OpCode::Div => a.checked_div(b),
        OpCode::Rem => a.checked_rem(b),
        other => {
            return Err(VmError::MalformedBody(format!("{} is not an arithmetic opcode", other.name())));
        }
    };
    if b == 0 {
        return Err(VmError::InvalidOperand {
            fault: OperandFault::DivideByZero,
            detail: "attempted to divide by zero".to_string(),
        });
    }
    checked.ok_or_else(|| VmError::InvalidOperand {
        fault: OperandFault::Overflow,
        detail: "arithmetic operation resulted in an overflow".to_string(),
    })
}

/// Comparison shared by `ceq`/`cgt`/`clt` and the compare-and-branch
/// opcodes. Equality is structural; ordering needs integers.
fn compare(opcode: OpCode, a: &Value, b: &Value) -> Result<bool, VmError> {
    match opcode {
        OpCode::Ceq | OpCode::Beq => Ok(a == b),
        OpCode::BneUn => Ok(a != b),
        OpCode::Cgt | OpCode::Bgt => Ok(to_int(a)? > to_int(b)?),
        OpCode::Clt | OpCode::Blt => Ok(to_int(a)? < to_int(b)?),
        OpCode::Bge => Ok(to_int(a)? >= to_int(b)?),
        OpCode::Ble => Ok(to_int(a)? <= to_int(b)?),
        other => Err(VmError::MalformedBody(format!("{} is not a comparison", other.name()))),
    }
}

fn method_signature(program: &LoadedProgram, member: &MemberRef) -> Result<MethodSignature, VmError> {
    member
        .signature
        .ok_or_else(|| VmError::UnsupportedCall(format!("{} is not a method", member_label(program, member))))
}

/// Intrinsic named by a member reference on a referenced type, if any.
fn intrinsic_for(program: &LoadedProgram, member: &MemberRef) -> Result<Option<Intrinsic>, VmError> {
    if member.parent.kind() != TokenKind::TypeRef {
        return Ok(None);
    }
    let type_name = program.cache().type_name(program.provider(), member.parent)?;
    Ok(Intrinsic::lookup(&type_name, &member.name))
}

fn member_label(program: &LoadedProgram, member: &MemberRef) -> String {
    let owner = program
        .cache()
        .type_name(program.provider(), member.parent)
        .unwrap_or_else(|_| member.parent.to_string());
    format!("{}::{}", owner, member.name)
}
