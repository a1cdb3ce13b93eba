use crate::{
    DecodeError, Instruction, InstructionDecoder, PackedReader, encode, write_packed, write_string,
};

pub const MAGIC: [u8; 4] = *b"STRM";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    /// A type by name; native types and module classes share the namespace.
    Type(String),
}

impl Constant {
    fn tag(&self) -> i64 {
        match self {
            Constant::Null => 0,
            Constant::Bool(_) => 1,
            Constant::Int(_) => 2,
            Constant::String(_) => 3,
            Constant::Type(_) => 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassDef {
    pub name: String,
    pub super_class: Option<String>,
    pub mixins: Vec<String>,
    pub fields: u32,
    /// Indices into [`Module::methods`].
    pub methods: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    /// Declared parameter types, checked when a call crosses a fiber.
    pub params: Vec<Option<String>>,
    pub registers: u32,
    pub code: Vec<Instruction>,
}

/// A serialized unit of code: constant pool, classes and methods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub constants: Vec<Constant>,
    pub classes: Vec<ClassDef>,
    pub methods: Vec<MethodDef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Intern a constant and return its pool index.
    pub fn constant(&mut self, constant: Constant) -> u32 {
        if let Some(idx) = self.constants.iter().position(|c| *c == constant) {
            return idx as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    pub fn add_method(&mut self, method: MethodDef) -> u32 {
        self.methods.push(method);
        (self.methods.len() - 1) as u32
    }

    pub fn add_class(&mut self, class: ClassDef) -> u32 {
        self.classes.push(class);
        (self.classes.len() - 1) as u32
    }

    pub fn method_index(&self, name: &str) -> Option<u32> {
        self.methods
            .iter()
            .position(|m| m.name == name)
            .map(|i| i as u32)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = MAGIC.to_vec();
        write_string(&mut buf, &self.name);

        write_packed(&mut buf, self.constants.len() as i64);
        for constant in &self.constants {
            write_packed(&mut buf, constant.tag());
            match constant {
                Constant::Null => {}
                Constant::Bool(b) => write_packed(&mut buf, *b as i64),
                Constant::Int(n) => write_packed(&mut buf, *n),
                Constant::String(s) | Constant::Type(s) => write_string(&mut buf, s),
            }
        }

        write_packed(&mut buf, self.classes.len() as i64);
        for class in &self.classes {
            write_string(&mut buf, &class.name);
            write_optional(&mut buf, class.super_class.as_deref());
            write_packed(&mut buf, class.mixins.len() as i64);
            for mixin in &class.mixins {
                write_string(&mut buf, mixin);
            }
            write_packed(&mut buf, class.fields as i64);
            write_packed(&mut buf, class.methods.len() as i64);
            for method in &class.methods {
                write_packed(&mut buf, *method as i64);
            }
        }

        write_packed(&mut buf, self.methods.len() as i64);
        for method in &self.methods {
            write_string(&mut buf, &method.name);
            write_packed(&mut buf, method.params.len() as i64);
            for param in &method.params {
                write_optional(&mut buf, param.as_deref());
            }
            write_packed(&mut buf, method.registers as i64);
            let code = encode(&method.code);
            write_packed(&mut buf, code.len() as i64);
            buf.extend_from_slice(&code);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = PackedReader::new(bytes);
        if reader.read_bytes(MAGIC.len()).map_err(|_| DecodeError::BadMagic)? != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let name = reader.read_string()?;

        let count = reader.read_index()?;
        let mut constants = Vec::new();
        for _ in 0..count {
            let pos = reader.position();
            let constant = match reader.read_packed()? {
                0 => Constant::Null,
                1 => Constant::Bool(reader.read_packed()? != 0),
                2 => Constant::Int(reader.read_packed()?),
                3 => Constant::String(reader.read_string()?),
                4 => Constant::Type(reader.read_string()?),
                tag => return Err(DecodeError::InvalidConstant { tag, pos }),
            };
            constants.push(constant);
        }

        let count = reader.read_index()?;
        let mut classes = Vec::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let super_class = read_optional(&mut reader)?;
            let mixin_count = reader.read_index()?;
            let mut mixins = Vec::new();
            for _ in 0..mixin_count {
                mixins.push(reader.read_string()?);
            }
            let fields = reader.read_index()?;
            let method_count = reader.read_index()?;
            let mut methods = Vec::new();
            for _ in 0..method_count {
                methods.push(reader.read_index()?);
            }
            classes.push(ClassDef {
                name,
                super_class,
                mixins,
                fields,
                methods,
            });
        }

        let count = reader.read_index()?;
        let mut methods = Vec::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let param_count = reader.read_index()?;
            let mut params = Vec::new();
            for _ in 0..param_count {
                params.push(read_optional(&mut reader)?);
            }
            let registers = reader.read_index()?;
            let len = reader.read_index()? as usize;
            let base = reader.position();
            let code = InstructionDecoder::new(reader.read_bytes(len)?)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| rebase(err, base))?;
            methods.push(MethodDef {
                name,
                params,
                registers,
                code,
            });
        }

        if !reader.is_at_end() {
            return Err(DecodeError::TrailingBytes {
                count: reader.remaining(),
            });
        }

        Ok(Self {
            name,
            constants,
            classes,
            methods,
        })
    }
}

fn write_optional(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            write_packed(buf, 1);
            write_string(buf, s);
        }
        None => write_packed(buf, 0),
    }
}

fn read_optional(reader: &mut PackedReader<'_>) -> Result<Option<String>, DecodeError> {
    match reader.read_packed()? {
        0 => Ok(None),
        _ => reader.read_string().map(Some),
    }
}

// positions inside a method body are relative to the body
fn rebase(err: DecodeError, base: usize) -> DecodeError {
    match err {
        DecodeError::UnexpectedEof { pos } => DecodeError::UnexpectedEof { pos: pos + base },
        DecodeError::PackedOverflow { pos, len } => DecodeError::PackedOverflow { pos: pos + base, len },
        DecodeError::InvalidOpcode { byte, pos } => DecodeError::InvalidOpcode { byte, pos: pos + base },
        DecodeError::InvalidArgument { raw, pos } => DecodeError::InvalidArgument { raw, pos: pos + base },
        DecodeError::OutOfRange { value, pos } => DecodeError::OutOfRange { value, pos: pos + base },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arg, BinaryCond, CodeBuilder};

    fn sample() -> Module {
        let mut module = Module::new("sample");
        let int = module.constant(Constant::Type("Int".into()));
        let five = module.constant(Constant::Int(5));
        let name = module.constant(Constant::String("compare".into()));
        assert_eq!(module.constant(Constant::Int(5)), five);

        let mut b = CodeBuilder::new();
        let taken = b.jump_cmp(BinaryCond::Eq, int, Arg::Reg(0), Arg::Const(five));
        b.ret(Arg::Const(five));
        b.bind(taken);
        b.invoke(Arg::Stack, Arg::Reg(0), name, &[Arg::Reg(0)]);
        b.ret(Arg::Stack);

        let method = module.add_method(MethodDef {
            name: "main".into(),
            params: vec![Some("Int".into())],
            registers: 1,
            code: b.finish(),
        });
        module.add_class(ClassDef {
            name: "Point".into(),
            super_class: Some("Shape".into()),
            mixins: vec!["Orderable".into()],
            fields: 2,
            methods: vec![method],
        });
        module
    }

    #[test]
    fn module_round_trip() {
        let module = sample();
        assert_eq!(Module::decode(&module.encode()).unwrap(), module);
    }

    #[test]
    fn bad_magic() {
        assert_eq!(Module::decode(b"NOPE"), Err(DecodeError::BadMagic));
        assert_eq!(Module::decode(b"ST"), Err(DecodeError::BadMagic));
    }

    #[test]
    fn truncated_module() {
        let bytes = sample().encode();
        assert!(Module::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn trailing_bytes() {
        let mut bytes = sample().encode();
        bytes.push(0);
        assert_eq!(Module::decode(&bytes), Err(DecodeError::TrailingBytes { count: 1 }));
    }
}
