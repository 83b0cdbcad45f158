//! Remote statements
//!
//! Every filesystem operation is a short program run on the target. Paths are
//! always embedded through [`py_quote`].

/// Quote `s` as a single-quoted Python string literal
pub fn py_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

const IMPORT_BINASCII: &str =
    "try:\n import ubinascii as binascii\nexcept ImportError:\n import binascii as binascii\n";

/// Directory listing as `name|mode|size` lines
pub fn list_dir(path: &str) -> String {
    format!(
        "import os\n\
         BASE={}\n\
         try:\n  il = os.ilistdir\n  use_il = True\n\
         except AttributeError:\n  use_il = False\n\
         if use_il:\n\
         \x20 for f in os.ilistdir(BASE):\n\
         \x20   size=(f[3] if len(f)>3 else 0)\n\
         \x20   print(f[0]+'|'+str(f[1])+'|'+str(size))\n\
         else:\n\
         \x20 for name in os.listdir(BASE):\n\
         \x20   p=(BASE.rstrip('/')+'/'+name) if BASE!='/' else '/'+name\n\
         \x20   try:\n\
         \x20     st=os.stat(p)\n\
         \x20     print(name+'|'+str(st[0])+'|'+str(st[6]))\n\
         \x20   except Exception:\n\
         \x20     print(name+'|0|0')",
        py_quote(path)
    )
}

/// Open `path` for reading and bind the reader to `r`
pub fn open_read(path: &str) -> String {
    format!("f=open({},'rb')\nr=f.read", py_quote(path))
}

/// Print the next `n` bytes of `r` as base64
pub fn read_chunk(n: usize) -> String {
    format!(
        "{}print(binascii.b2a_base64(r({})).decode().strip())",
        IMPORT_BINASCII, n
    )
}

/// Open `path` for writing (or appending) and bind the writer to `w`
pub fn open_write(path: &str, append: bool) -> String {
    let mode = if append { "ab" } else { "wb" };
    format!("f=open({},'{}')\nw=f.write", py_quote(path), mode)
}

/// Decode one base64 chunk and write it through `w`
pub fn write_chunk(b64: &str) -> String {
    format!("{}w(binascii.a2b_base64('{}'))", IMPORT_BINASCII, b64)
}

/// Close the open file handle `f`
pub fn close() -> &'static str {
    "f.close()"
}

/// Print `1` if `path` exists, `0` otherwise
pub fn exists(path: &str) -> String {
    format!(
        "import os\ntry:\n os.stat({})\n print('1')\nexcept:\n print('0')",
        py_quote(path)
    )
}

/// Print `mode size`
pub fn stat(path: &str) -> String {
    format!("import os\ns=os.stat({})\nprint(s[0],s[6])", py_quote(path))
}

/// Remove a file
pub fn remove(path: &str) -> String {
    format!("import os\nos.remove({})", py_quote(path))
}

/// Create a directory
pub fn mkdir(path: &str) -> String {
    format!("import os\nos.mkdir({})", py_quote(path))
}

/// Remove an empty directory
pub fn rmdir(path: &str) -> String {
    format!("import os\nos.rmdir({})", py_quote(path))
}

/// Marker printed by [`rename`] on success
pub const RENAME_OK: &str = "OK";

/// Native rename, printing `OK` or `FAIL`
pub fn rename(from: &str, to: &str) -> String {
    format!(
        "import os\ntry:\n  os.rename({},{})\n  print('OK')\nexcept Exception as e:\n  print('FAIL')",
        py_quote(from),
        py_quote(to)
    )
}

/// Create `path` if missing, leaving content alone
pub fn touch(path: &str) -> String {
    format!("open({},'a').close()", py_quote(path))
}

/// Copy on the target without moving the content over the link
pub fn copy(from: &str, to: &str) -> String {
    format!(
        "fr=open({},'rb')\nfw=open({},'wb')\nfw.write(fr.read())\nfw.close()\nfr.close()",
        py_quote(from),
        py_quote(to)
    )
}
