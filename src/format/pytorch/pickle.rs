//! Just enough of the pickle protocol to read and write torch checkpoints.
//!
//! The reader builds an [`Object`] tree without executing anything: globals
//! stay symbolic and `REDUCE`/`BUILD` are recorded as nodes for the caller to
//! interpret. `collections.OrderedDict` is the one callable folded eagerly,
//! since `SETITEMS` has to mutate it in place.
//!
//! The writer emits protocol 2, the protocol `torch.save` uses by default.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::io::BufRead;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::ir::Tensor;

#[derive(Error, Debug)]
pub enum PickleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpCode(u8),
    #[error("unsupported protocol {0}")]
    InvalidProtocol(u8),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("no MARK on the stack")]
    MissingMark,
    #[error("memo entry {0} not found")]
    MemoNotFound(u32),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("cannot pickle {0}")]
    Unpicklable(String),
}

type Result<T> = std::result::Result<T, PickleError>;

#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
enum OpCode {
    Proto = 0x80,
    Frame = 0x95,
    Stop = b'.',
    Mark = b'(',
    Global = b'c',
    StackGlobal = 0x93,
    BinPut = b'q',
    LongBinPut = b'r',
    Memoize = 0x94,
    BinGet = b'h',
    LongBinGet = b'j',
    EmptyTuple = b')',
    Tuple = b't',
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    EmptyList = b']',
    List = b'l',
    Append = b'a',
    Appends = b'e',
    EmptyDict = b'}',
    Dict = b'd',
    SetItem = b's',
    SetItems = b'u',
    None = b'N',
    NewTrue = 0x88,
    NewFalse = 0x89,
    Int = b'I',
    BinInt = b'J',
    BinInt1 = b'K',
    BinInt2 = b'M',
    Long1 = 0x8a,
    BinFloat = b'G',
    BinUnicode = b'X',
    ShortBinUnicode = 0x8c,
    BinUnicode8 = 0x8d,
    BinString = b'T',
    ShortBinString = b'U',
    BinBytes = b'B',
    ShortBinBytes = b'C',
    BinPersId = b'Q',
    Reduce = b'R',
    Build = b'b',
    NewObj = 0x81,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        use OpCode::*;
        Ok(match value {
            0x80 => Proto,
            0x95 => Frame,
            b'.' => Stop,
            b'(' => Mark,
            b'c' => Global,
            0x93 => StackGlobal,
            b'q' => BinPut,
            b'r' => LongBinPut,
            0x94 => Memoize,
            b'h' => BinGet,
            b'j' => LongBinGet,
            b')' => EmptyTuple,
            b't' => Tuple,
            0x85 => Tuple1,
            0x86 => Tuple2,
            0x87 => Tuple3,
            b']' => EmptyList,
            b'l' => List,
            b'a' => Append,
            b'e' => Appends,
            b'}' => EmptyDict,
            b'd' => Dict,
            b's' => SetItem,
            b'u' => SetItems,
            b'N' => None,
            0x88 => NewTrue,
            0x89 => NewFalse,
            b'I' => Int,
            b'J' => BinInt,
            b'K' => BinInt1,
            b'M' => BinInt2,
            0x8a => Long1,
            b'G' => BinFloat,
            b'X' => BinUnicode,
            0x8c => ShortBinUnicode,
            0x8d => BinUnicode8,
            b'T' => BinString,
            b'U' => ShortBinString,
            b'B' => BinBytes,
            b'C' => ShortBinBytes,
            b'Q' => BinPersId,
            b'R' => Reduce,
            b'b' => Build,
            0x81 => NewObj,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Object>),
    List(Vec<Object>),
    /// Key order is preserved.
    Dict(Vec<(Object, Object)>),
    Global {
        module: String,
        name: String,
    },
    PersistentId(Box<Object>),
    Reduce {
        callable: Box<Object>,
        args: Box<Object>,
    },
    Build {
        target: Box<Object>,
        state: Box<Object>,
    },
    /// A tensor whose storage has been resolved. Never produced by the
    /// reader itself.
    Tensor(Tensor),
}

impl Object {
    pub fn global(module: &str, name: &str) -> Self {
        Object::Global {
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_global(&self, module: &str, name: &str) -> bool {
        matches!(self, Object::Global { module: m, name: n } if m == module && n == name)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Python-flavoured rendering, stable across runs.
impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Object]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        }

        match self {
            Object::None => f.write_str("None"),
            Object::Bool(true) => f.write_str("True"),
            Object::Bool(false) => f.write_str("False"),
            Object::Int(i) => write!(f, "{}", i),
            Object::Float(v) if v.is_nan() => f.write_str("nan"),
            Object::Float(v) if v.is_infinite() => {
                f.write_str(if *v > 0.0 { "inf" } else { "-inf" })
            }
            Object::Float(v) if v.fract() == 0.0 && v.abs() < 1e16 => write!(f, "{:.1}", v),
            Object::Float(v) => write!(f, "{}", v),
            Object::String(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Object::Bytes(b) => write!(f, "b<{} bytes>", b.len()),
            Object::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0]),
            Object::Tuple(items) => {
                f.write_str("(")?;
                join(f, items)?;
                f.write_str(")")
            }
            Object::List(items) => {
                f.write_str("[")?;
                join(f, items)?;
                f.write_str("]")
            }
            Object::Dict(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            Object::Global { module, name } => write!(f, "{}.{}", module, name),
            Object::PersistentId(pid) => write!(f, "persistent_id{}", pid),
            Object::Reduce { callable, args } => match args.as_ref() {
                Object::Tuple(items) => {
                    write!(f, "{}(", callable)?;
                    join(f, items)?;
                    f.write_str(")")
                }
                other => write!(f, "{}{}", callable, other),
            },
            Object::Build { target, state } => write!(f, "{}<state {}>", target, state),
            Object::Tensor(t) => write!(
                f,
                "tensor(shape={:?}, dtype={})",
                t.shape, t.data_type
            ),
        }
    }
}

/// A stack slot. Memoized objects become shared so that containers filled
/// after `BINPUT` are seen complete through every later `BINGET`.
enum Slot {
    Owned(Object),
    Shared(Rc<RefCell<Object>>),
}

impl Slot {
    fn into_object(self) -> Object {
        match self {
            Slot::Owned(o) => o,
            Slot::Shared(cell) => cell.borrow().clone(),
        }
    }
}

struct Stack {
    stack: Vec<Slot>,
    marks: Vec<usize>,
    memo: HashMap<u32, Rc<RefCell<Object>>>,
}

impl Stack {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn push(&mut self, o: Object) {
        self.stack.push(Slot::Owned(o))
    }

    fn pop(&mut self) -> Result<Object> {
        self.stack
            .pop()
            .map(Slot::into_object)
            .ok_or(PickleError::StackUnderflow)
    }

    /// Mutate the top object in place, through its memo cell if it has one.
    fn with_top<T>(&mut self, f: impl FnOnce(&mut Object) -> Result<T>) -> Result<T> {
        match self.stack.last_mut().ok_or(PickleError::StackUnderflow)? {
            Slot::Owned(o) => f(o),
            Slot::Shared(cell) => f(&mut cell.borrow_mut()),
        }
    }

    fn push_mark(&mut self) {
        self.marks.push(self.stack.len());
    }

    fn pop_to_mark(&mut self) -> Result<Vec<Object>> {
        let pos = self.marks.pop().ok_or(PickleError::MissingMark)?;
        if pos > self.stack.len() {
            return Err(PickleError::StackUnderflow);
        }
        Ok(self
            .stack
            .split_off(pos)
            .into_iter()
            .map(Slot::into_object)
            .collect())
    }

    fn memo_put(&mut self, idx: u32) -> Result<()> {
        let slot = self.stack.last_mut().ok_or(PickleError::StackUnderflow)?;
        let cell = match slot {
            Slot::Shared(cell) => cell.clone(),
            Slot::Owned(o) => {
                let cell = Rc::new(RefCell::new(std::mem::replace(o, Object::None)));
                *slot = Slot::Shared(cell.clone());
                cell
            }
        };
        self.memo.insert(idx, cell);
        Ok(())
    }

    fn memo_get(&mut self, idx: u32) -> Result<()> {
        let cell = self.memo.get(&idx).ok_or(PickleError::MemoNotFound(idx))?;
        self.stack.push(Slot::Shared(cell.clone()));
        Ok(())
    }
}

fn read_line<R: BufRead>(r: &mut R) -> Result<String> {
    let mut data = Vec::with_capacity(32);
    r.read_until(b'\n', &mut data)?;
    if data.pop() != Some(b'\n') {
        return Err(PickleError::InvalidData("unterminated line".to_string()));
    }
    if data.last() == Some(&b'\r') {
        data.pop();
    }
    utf8(data)
}

fn read_bytes<R: BufRead>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(data)
}

fn utf8(data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|e| PickleError::InvalidData(format!("invalid UTF-8: {}", e)))
}

fn decode_long(data: &[u8]) -> Result<i64> {
    if data.is_empty() {
        return Ok(0);
    }
    if data.len() > 8 {
        let (low, high) = data.split_at(8);
        let sign = if low[7] & 0x80 != 0 { 0xff } else { 0x00 };
        if high.iter().any(|&b| b != sign) {
            return Err(PickleError::InvalidData(format!(
                "integer of {} bytes does not fit in 64 bits",
                data.len()
            )));
        }
        return Ok(i64::from_le_bytes(low.try_into().unwrap_or([0; 8])));
    }
    let fill = if data[data.len() - 1] & 0x80 != 0 { 0xff } else { 0x00 };
    let mut buf = [fill; 8];
    buf[..data.len()].copy_from_slice(data);
    Ok(i64::from_le_bytes(buf))
}

fn ordered_dict(args: Object) -> Result<Object> {
    let items = match args {
        Object::Tuple(mut items) if items.len() == 1 => items.remove(0),
        Object::Tuple(items) if items.is_empty() => return Ok(Object::Dict(Vec::new())),
        other => {
            return Err(PickleError::InvalidData(format!(
                "unexpected OrderedDict arguments {}",
                other
            )))
        }
    };
    match items {
        Object::List(pairs) | Object::Tuple(pairs) => pairs
            .into_iter()
            .map(|pair| match pair {
                Object::Tuple(mut kv) | Object::List(mut kv) if kv.len() == 2 => {
                    let v = kv.pop().unwrap_or(Object::None);
                    let k = kv.pop().unwrap_or(Object::None);
                    Ok((k, v))
                }
                other => Err(PickleError::InvalidData(format!(
                    "OrderedDict item is not a pair: {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Object::Dict),
        Object::Dict(entries) => Ok(Object::Dict(entries)),
        other => Err(PickleError::InvalidData(format!(
            "unexpected OrderedDict items {}",
            other
        ))),
    }
}

pub fn read_pickle<R: BufRead>(r: &mut R) -> Result<Object> {
    let mut stack = Stack::new();
    loop {
        let code = r.read_u8()?;
        let op = OpCode::try_from(code).map_err(PickleError::InvalidOpCode)?;
        match op {
            OpCode::Proto => {
                let version = r.read_u8()?;
                if version > 5 {
                    return Err(PickleError::InvalidProtocol(version));
                }
            }
            OpCode::Frame => {
                r.read_u64::<LittleEndian>()?;
            }
            OpCode::Stop => return stack.pop(),
            OpCode::Mark => stack.push_mark(),
            OpCode::Global => {
                let module = read_line(r)?;
                let name = read_line(r)?;
                stack.push(Object::Global { module, name });
            }
            OpCode::StackGlobal => {
                let name = stack.pop()?;
                let module = stack.pop()?;
                match (module, name) {
                    (Object::String(module), Object::String(name)) => {
                        stack.push(Object::Global { module, name })
                    }
                    _ => {
                        return Err(PickleError::InvalidData(
                            "STACK_GLOBAL expects two strings".to_string(),
                        ))
                    }
                }
            }
            OpCode::BinPut => {
                let idx = r.read_u8()? as u32;
                stack.memo_put(idx)?;
            }
            OpCode::LongBinPut => {
                let idx = r.read_u32::<LittleEndian>()?;
                stack.memo_put(idx)?;
            }
            OpCode::Memoize => {
                let idx = stack.memo.len() as u32;
                stack.memo_put(idx)?;
            }
            OpCode::BinGet => {
                let idx = r.read_u8()? as u32;
                stack.memo_get(idx)?;
            }
            OpCode::LongBinGet => {
                let idx = r.read_u32::<LittleEndian>()?;
                stack.memo_get(idx)?;
            }
            OpCode::EmptyTuple => stack.push(Object::Tuple(Vec::new())),
            OpCode::Tuple => {
                let items = stack.pop_to_mark()?;
                stack.push(Object::Tuple(items));
            }
            OpCode::Tuple1 => {
                let a = stack.pop()?;
                stack.push(Object::Tuple(vec![a]));
            }
            OpCode::Tuple2 => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                stack.push(Object::Tuple(vec![a, b]));
            }
            OpCode::Tuple3 => {
                let c = stack.pop()?;
                let b = stack.pop()?;
                let a = stack.pop()?;
                stack.push(Object::Tuple(vec![a, b, c]));
            }
            OpCode::EmptyList => stack.push(Object::List(Vec::new())),
            OpCode::List => {
                let items = stack.pop_to_mark()?;
                stack.push(Object::List(items));
            }
            OpCode::Append => {
                let value = stack.pop()?;
                stack.with_top(|top| match top {
                    Object::List(items) => {
                        items.push(value);
                        Ok(())
                    }
                    other => Err(PickleError::InvalidData(format!("APPEND on {}", other))),
                })?;
            }
            OpCode::Appends => {
                let values = stack.pop_to_mark()?;
                stack.with_top(|top| match top {
                    Object::List(items) => {
                        items.extend(values);
                        Ok(())
                    }
                    other => Err(PickleError::InvalidData(format!("APPENDS on {}", other))),
                })?;
            }
            OpCode::EmptyDict => stack.push(Object::Dict(Vec::new())),
            OpCode::Dict => {
                let items = stack.pop_to_mark()?;
                stack.push(Object::Dict(pairs(items)?));
            }
            OpCode::SetItem => {
                let value = stack.pop()?;
                let key = stack.pop()?;
                stack.with_top(|top| set_items(top, vec![(key, value)]))?;
            }
            OpCode::SetItems => {
                let items = stack.pop_to_mark()?;
                let items = pairs(items)?;
                stack.with_top(|top| set_items(top, items))?;
            }
            OpCode::None => stack.push(Object::None),
            OpCode::NewTrue => stack.push(Object::Bool(true)),
            OpCode::NewFalse => stack.push(Object::Bool(false)),
            OpCode::Int => {
                let line = read_line(r)?;
                let value = match line.as_str() {
                    "01" => Object::Bool(true),
                    "00" => Object::Bool(false),
                    s => Object::Int(s.parse::<i64>().map_err(|e| {
                        PickleError::InvalidData(format!("invalid INT '{}': {}", s, e))
                    })?),
                };
                stack.push(value);
            }
            OpCode::BinInt => {
                let v = r.read_i32::<LittleEndian>()?;
                stack.push(Object::Int(v as i64));
            }
            OpCode::BinInt1 => {
                let v = r.read_u8()?;
                stack.push(Object::Int(v as i64));
            }
            OpCode::BinInt2 => {
                let v = r.read_u16::<LittleEndian>()?;
                stack.push(Object::Int(v as i64));
            }
            OpCode::Long1 => {
                let len = r.read_u8()? as usize;
                let data = read_bytes(r, len)?;
                stack.push(Object::Int(decode_long(&data)?));
            }
            OpCode::BinFloat => {
                let v = r.read_f64::<BigEndian>()?;
                stack.push(Object::Float(v));
            }
            OpCode::BinUnicode => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let s = utf8(read_bytes(r, len)?)?;
                stack.push(Object::String(s));
            }
            OpCode::ShortBinUnicode => {
                let len = r.read_u8()? as usize;
                let s = utf8(read_bytes(r, len)?)?;
                stack.push(Object::String(s));
            }
            OpCode::BinUnicode8 => {
                let len = r.read_u64::<LittleEndian>()? as usize;
                let s = utf8(read_bytes(r, len)?)?;
                stack.push(Object::String(s));
            }
            OpCode::BinString => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let s = String::from_utf8_lossy(&read_bytes(r, len)?).into_owned();
                stack.push(Object::String(s));
            }
            OpCode::ShortBinString => {
                let len = r.read_u8()? as usize;
                let s = String::from_utf8_lossy(&read_bytes(r, len)?).into_owned();
                stack.push(Object::String(s));
            }
            OpCode::BinBytes => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let b = read_bytes(r, len)?;
                stack.push(Object::Bytes(b));
            }
            OpCode::ShortBinBytes => {
                let len = r.read_u8()? as usize;
                let b = read_bytes(r, len)?;
                stack.push(Object::Bytes(b));
            }
            OpCode::BinPersId => {
                let pid = stack.pop()?;
                stack.push(Object::PersistentId(Box::new(pid)));
            }
            OpCode::Reduce | OpCode::NewObj => {
                let args = stack.pop()?;
                let callable = stack.pop()?;
                if callable.is_global("collections", "OrderedDict") {
                    stack.push(ordered_dict(args)?);
                } else {
                    stack.push(Object::Reduce {
                        callable: Box::new(callable),
                        args: Box::new(args),
                    });
                }
            }
            OpCode::Build => {
                let state = stack.pop()?;
                // Applied in place so memoized references see the built object.
                // Dict state (e.g. a state dict's `_metadata`) carries nothing we keep.
                stack.with_top(|target| {
                    if !matches!(target, Object::Dict(_)) {
                        let inner = std::mem::replace(target, Object::None);
                        *target = Object::Build {
                            target: Box::new(inner),
                            state: Box::new(state),
                        };
                    }
                    Ok(())
                })?;
            }
        }
    }
}

fn pairs(items: Vec<Object>) -> Result<Vec<(Object, Object)>> {
    if items.len() % 2 != 0 {
        return Err(PickleError::InvalidData(
            "odd number of items for a dict".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Ok(out)
}

fn set_items(target: &mut Object, items: Vec<(Object, Object)>) -> Result<()> {
    match target {
        Object::Dict(entries) => {
            for (k, v) in items {
                match entries.iter_mut().find(|(existing, _)| *existing == k) {
                    Some(entry) => entry.1 = v,
                    None => entries.push((k, v)),
                }
            }
            Ok(())
        }
        other => Err(PickleError::InvalidData(format!("SETITEMS on {}", other))),
    }
}

/// Protocol 2 pickle encoder.
pub struct PickleWriter {
    buf: Vec<u8>,
}

impl Default for PickleWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PickleWriter {
    pub fn new() -> Self {
        Self {
            buf: vec![OpCode::Proto as u8, 2],
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.op(OpCode::Stop);
        self.buf
    }

    fn op(&mut self, op: OpCode) {
        self.buf.push(op as u8);
    }

    pub fn write(&mut self, obj: &Object) -> Result<()> {
        match obj {
            Object::None => self.op(OpCode::None),
            Object::Bool(true) => self.op(OpCode::NewTrue),
            Object::Bool(false) => self.op(OpCode::NewFalse),
            Object::Int(v) => self.write_int(*v),
            Object::Float(v) => {
                self.op(OpCode::BinFloat);
                self.buf.extend_from_slice(&v.to_be_bytes());
            }
            Object::String(s) => {
                self.op(OpCode::BinUnicode);
                self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                self.buf.extend_from_slice(s.as_bytes());
            }
            Object::Tuple(items) => match items.len() {
                0 => self.op(OpCode::EmptyTuple),
                1..=3 => {
                    for item in items {
                        self.write(item)?;
                    }
                    self.op(match items.len() {
                        1 => OpCode::Tuple1,
                        2 => OpCode::Tuple2,
                        _ => OpCode::Tuple3,
                    });
                }
                _ => {
                    self.op(OpCode::Mark);
                    for item in items {
                        self.write(item)?;
                    }
                    self.op(OpCode::Tuple);
                }
            },
            Object::List(items) => {
                self.op(OpCode::EmptyList);
                if !items.is_empty() {
                    self.op(OpCode::Mark);
                    for item in items {
                        self.write(item)?;
                    }
                    self.op(OpCode::Appends);
                }
            }
            Object::Dict(entries) => {
                self.op(OpCode::EmptyDict);
                if !entries.is_empty() {
                    self.op(OpCode::Mark);
                    for (k, v) in entries {
                        self.write(k)?;
                        self.write(v)?;
                    }
                    self.op(OpCode::SetItems);
                }
            }
            Object::Global { module, name } => {
                self.op(OpCode::Global);
                self.buf.extend_from_slice(module.as_bytes());
                self.buf.push(b'\n');
                self.buf.extend_from_slice(name.as_bytes());
                self.buf.push(b'\n');
            }
            Object::PersistentId(pid) => {
                self.write(pid)?;
                self.op(OpCode::BinPersId);
            }
            Object::Reduce { callable, args } => {
                self.write(callable)?;
                self.write(args)?;
                self.op(OpCode::Reduce);
            }
            Object::Build { target, state } => {
                self.write(target)?;
                self.write(state)?;
                self.op(OpCode::Build);
            }
            Object::Bytes(_) => return Err(PickleError::Unpicklable("bytes".to_string())),
            Object::Tensor(t) => {
                return Err(PickleError::Unpicklable(format!(
                    "tensor '{}' without a storage",
                    t.name
                )))
            }
        }
        Ok(())
    }

    fn write_int(&mut self, v: i64) {
        if (0..=0xff).contains(&v) {
            self.op(OpCode::BinInt1);
            self.buf.push(v as u8);
        } else if (0..=0xffff).contains(&v) {
            self.op(OpCode::BinInt2);
            self.buf.extend_from_slice(&(v as u16).to_le_bytes());
        } else if i32::try_from(v).is_ok() {
            self.op(OpCode::BinInt);
            self.buf.extend_from_slice(&(v as i32).to_le_bytes());
        } else {
            self.op(OpCode::Long1);
            self.buf.push(8);
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(obj: &Object) -> Object {
        let mut writer = PickleWriter::new();
        writer.write(obj).unwrap();
        let bytes = writer.finish();
        read_pickle(&mut bytes.as_slice()).unwrap()
    }

    #[test]
    fn test_scalars_and_containers() {
        let obj = Object::Dict(vec![
            (Object::String("epoch".into()), Object::Int(3)),
            (Object::String("step".into()), Object::Int(70_000)),
            (Object::String("big".into()), Object::Int(-5_000_000_000)),
            (Object::String("neg".into()), Object::Int(-1)),
            (Object::String("lr".into()), Object::Float(1e-3)),
            (Object::String("ok".into()), Object::Bool(true)),
            (Object::String("none".into()), Object::None),
            (
                Object::String("betas".into()),
                Object::Tuple(vec![Object::Float(0.9), Object::Float(0.999)]),
            ),
            (
                Object::String("layers".into()),
                Object::List(vec![Object::Int(1), Object::String("x".into())]),
            ),
        ]);
        assert_eq!(roundtrip(&obj), obj);
    }

    #[test]
    fn test_long_tuple_and_reduce() {
        let obj = Object::Reduce {
            callable: Box::new(Object::global("torch._utils", "_rebuild_tensor_v2")),
            args: Box::new(Object::Tuple(vec![
                Object::PersistentId(Box::new(Object::Tuple(vec![
                    Object::String("storage".into()),
                    Object::global("torch", "FloatStorage"),
                    Object::String("0".into()),
                    Object::String("cpu".into()),
                    Object::Int(4),
                ]))),
                Object::Int(0),
                Object::Tuple(vec![Object::Int(2), Object::Int(2)]),
                Object::Tuple(vec![Object::Int(2), Object::Int(1)]),
                Object::Bool(false),
                Object::Dict(vec![]),
            ])),
        };
        assert_eq!(roundtrip(&obj), obj);
    }

    #[test]
    fn test_ordered_dict_with_setitems_and_build() {
        // OrderedDict() ; SETITEMS {'a': 1} ; BUILD {'_metadata': {}}
        let mut bytes = vec![0x80, 2];
        bytes.extend_from_slice(b"ccollections\nOrderedDict\nq\x00)R");
        bytes.extend_from_slice(b"q\x01(X\x01\x00\x00\x00aK\x01u");
        bytes.extend_from_slice(b"}X\x09\x00\x00\x00_metadata}sb.");
        let obj = read_pickle(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            obj,
            Object::Dict(vec![(Object::String("a".into()), Object::Int(1))])
        );
    }

    #[test]
    fn test_memo_and_protocol_4_opcodes() {
        // PROTO 4, FRAME, 'k', MEMOIZE, [], MEMOIZE, TUPLE2, BINGET 0, TUPLE2, STOP
        let mut bytes = vec![0x80, 4, 0x95];
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&[0x8c, 1, b'k', 0x94, b']', 0x94, 0x86, b'h', 0, 0x86, b'.']);
        let obj = read_pickle(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            obj,
            Object::Tuple(vec![
                Object::Tuple(vec![Object::String("k".into()), Object::List(vec![])]),
                Object::String("k".into()),
            ])
        );
    }

    #[test]
    fn test_memoized_dict_shared_by_two_keys() {
        // h = {'x': 1}; {'a': h, 'b': h} at protocol 2, h filled after BINPUT
        let mut bytes = vec![0x80, 2];
        bytes.extend_from_slice(b"}q\x00(X\x01\x00\x00\x00aq\x01}q\x02");
        bytes.extend_from_slice(b"X\x01\x00\x00\x00xq\x03K\x01s");
        bytes.extend_from_slice(b"X\x01\x00\x00\x00bq\x04h\x02u.");
        let inner = Object::Dict(vec![(Object::String("x".into()), Object::Int(1))]);
        let obj = read_pickle(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            obj,
            Object::Dict(vec![
                (Object::String("a".into()), inner.clone()),
                (Object::String("b".into()), inner),
            ])
        );
    }

    #[test]
    fn test_memoized_list_appended_after_reference() {
        // l = []; (l, l) where l gets its items after both references exist
        let mut bytes = vec![0x80, 2];
        bytes.extend_from_slice(b"]q\x00h\x00K\x07a\x86.");
        let obj = read_pickle(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            obj,
            Object::Tuple(vec![
                Object::List(vec![Object::Int(7)]),
                Object::List(vec![Object::Int(7)]),
            ])
        );
    }

    #[test]
    fn test_long1_decoding() {
        assert_eq!(decode_long(&[]).unwrap(), 0);
        assert_eq!(decode_long(&[0xff]).unwrap(), -1);
        assert_eq!(decode_long(&[0x00, 0x80, 0x00]).unwrap(), 0x8000);
        assert_eq!(
            decode_long(&[0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00]).unwrap(),
            1 << 39
        );
        assert!(decode_long(&[0, 0, 0, 0, 0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_truncated_and_invalid_input() {
        assert!(read_pickle(&mut &b"\x80\x02K"[..]).is_err());
        assert!(matches!(
            read_pickle(&mut &b"\x80\x02\xff"[..]),
            Err(PickleError::InvalidOpCode(0xff))
        ));
        assert!(matches!(
            read_pickle(&mut &b"\x80\x02t."[..]),
            Err(PickleError::MissingMark)
        ));
    }

    #[test]
    fn test_display_is_python_like() {
        let obj = Object::Dict(vec![(
            Object::String("betas".into()),
            Object::Tuple(vec![Object::Float(0.9), Object::Float(1.0)]),
        )]);
        assert_eq!(obj.to_string(), "{'betas': (0.9, 1.0)}");
        let reduce = Object::Reduce {
            callable: Box::new(Object::global("torch.optim.lr_scheduler", "StepLR")),
            args: Box::new(Object::Tuple(vec![Object::Int(10)])),
        };
        assert_eq!(reduce.to_string(), "torch.optim.lr_scheduler.StepLR(10)");
        assert_eq!(Object::Tuple(vec![Object::None]).to_string(), "(None,)");
    }

    #[test]
    fn test_tensor_cannot_be_pickled_without_storage() {
        let mut writer = PickleWriter::new();
        let t = Tensor {
            name: "w".into(),
            shape: vec![1],
            data_type: crate::ir::DataType::F32,
            data: vec![0; 4],
        };
        assert!(matches!(
            writer.write(&Object::Tensor(t)),
            Err(PickleError::Unpicklable(_))
        ));
    }
}
