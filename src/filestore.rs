use spacepackets::cfdp::ChecksumType;
use spacepackets::ByteConversionError;
#[cfg(feature = "std")]
pub use std_mod::*;

#[derive(Debug, thiserror::Error)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("directory does not exist")]
    DirDoesNotExist,
    #[error("permission error")]
    Permission,
    #[error("is not a file")]
    IsNotFile,
    #[error("is not a directory")]
    IsNotDirectory,
    #[error("path escapes the filestore root directory")]
    PathEscapesRootDir,
    #[error("byte conversion: {0}")]
    ByteConversion(#[from] ByteConversionError),
    #[error("IO error: {0})")]
    #[cfg(feature = "std")]
    Io(#[from] std::io::Error),
    #[error("checksum type not implemented: {0:?}")]
    ChecksumTypeNotImplemented(ChecksumType),
    #[error("utf8 error")]
    Utf8Error,
    #[error("other error")]
    Other,
}

pub trait VirtualFilestore {
    /// Create a file at the given path. Missing parent directories are created as well.
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    /// Truncating a file means deleting all its data so the resulting file is empty.
    /// This can be more efficient than removing and re-creating a file.
    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError>;
    fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError>;

    fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError>;

    /// Append the contents of the second file to the first file.
    fn append_file(&self, file_path: &str, file_to_append: &str) -> Result<(), FilestoreError>;

    /// Replace the contents of the first file with the contents of the second file.
    fn replace_file(&self, replaced_file: &str, source_file: &str) -> Result<(), FilestoreError>;

    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError>;

    fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError>;

    fn filename_from_full_path(path: &str) -> Option<&str>
    where
        Self: Sized;

    fn is_file(&self, path: &str) -> Result<bool, FilestoreError>;

    fn is_dir(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(!self.is_file(path)?)
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    /// Extract the file name part of a full path.
    ///
    /// This method should behave similarly to the [std::path::Path::file_name] method.
    fn file_name<'a>(&self, full_path: &'a str) -> Result<Option<&'a str>, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// This special function is the CFDP specific abstraction to calculate the checksum of a file.
    /// This allows to keep OS specific details like reading the whole file in the most efficient
    /// manner inside the file system abstraction.
    ///
    /// The passed verification buffer argument will be used by the specific implementation as
    /// a buffer to read the file into. It is recommended to use common buffer sizes like
    /// 4096 or 8192 bytes.
    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;

    /// This special function is the CFDP specific abstraction to verify the checksum of a file.
    /// This allows to keep OS specific details like reading the whole file in the most efficient
    /// manner inside the file system abstraction.
    ///
    /// The passed verification buffer argument will be used by the specific implementation as
    /// a buffer to read the file into. It is recommended to use common buffer sizes like
    /// 4096 or 8192 bytes.
    fn checksum_verify(
        &self,
        expected_checksum: u32,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<bool, FilestoreError> {
        Ok(
            self.calculate_checksum(file_path, checksum_type, size_to_verify, verification_buf)?
                == expected_checksum,
        )
    }
}

#[cfg(feature = "std")]
pub mod std_mod {

    use crc::Crc;

    use crate::{CRC_32, CRC_32C};

    use super::*;
    use std::{
        fs::{self, File, OpenOptions},
        io::{BufReader, Read, Seek, SeekFrom, Write},
        path::{Component, Path, PathBuf},
    };

    #[derive(Default)]
    pub struct NativeFilestore {}

    impl VirtualFilestore for NativeFilestore {
        fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            if self.exists(file_path)? {
                return Err(FilestoreError::FileAlreadyExists);
            }
            if let Some(parent) = Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            File::create(file_path)?;
            Ok(())
        }

        fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            if !self.exists(file_path)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !self.is_file(file_path)? {
                return Err(FilestoreError::IsNotFile);
            }
            fs::remove_file(file_path)?;
            Ok(())
        }

        fn file_name<'a>(&self, full_path: &'a str) -> Result<Option<&'a str>, FilestoreError> {
            let path = Path::new(full_path);
            path.file_name()
                .map(|s| s.to_str())
                .ok_or(FilestoreError::Utf8Error)
        }

        fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            if !self.exists(file_path)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !self.is_file(file_path)? {
                return Err(FilestoreError::IsNotFile);
            }
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(file_path)?;
            Ok(())
        }

        fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError> {
            fs::create_dir(dir_path)?;
            Ok(())
        }

        fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError> {
            if !self.exists(dir_path)? {
                return Err(FilestoreError::DirDoesNotExist);
            }
            if !self.is_dir(dir_path)? {
                return Err(FilestoreError::IsNotDirectory);
            }
            if !all {
                fs::remove_dir(dir_path)?;
                return Ok(());
            }
            fs::remove_dir_all(dir_path)?;
            Ok(())
        }

        fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError> {
            if !self.exists(old_path)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !self.is_file(old_path)? {
                return Err(FilestoreError::IsNotFile);
            }
            fs::rename(old_path, new_path)?;
            Ok(())
        }

        fn append_file(&self, file_path: &str, file_to_append: &str) -> Result<(), FilestoreError> {
            if !self.exists(file_path)? || !self.exists(file_to_append)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !self.is_file(file_path)? || !self.is_file(file_to_append)? {
                return Err(FilestoreError::IsNotFile);
            }
            let mut file = OpenOptions::new().append(true).open(file_path)?;
            let mut reader = BufReader::new(File::open(file_to_append)?);
            std::io::copy(&mut reader, &mut file)?;
            Ok(())
        }

        fn replace_file(
            &self,
            replaced_file: &str,
            source_file: &str,
        ) -> Result<(), FilestoreError> {
            if !self.exists(replaced_file)? || !self.exists(source_file)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !self.is_file(replaced_file)? || !self.is_file(source_file)? {
                return Err(FilestoreError::IsNotFile);
            }
            fs::copy(source_file, replaced_file)?;
            Ok(())
        }

        fn read_data(
            &self,
            file_name: &str,
            offset: u64,
            read_len: u64,
            buf: &mut [u8],
        ) -> Result<(), FilestoreError> {
            if buf.len() < read_len as usize {
                return Err(ByteConversionError::ToSliceTooSmall {
                    found: buf.len(),
                    expected: read_len as usize,
                }
                .into());
            }
            if !self.exists(file_name)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !self.is_file(file_name)? {
                return Err(FilestoreError::IsNotFile);
            }
            let mut file = File::open(file_name)?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf[0..read_len as usize])?;
            Ok(())
        }

        fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError> {
            if !self.exists(file)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !self.is_file(file)? {
                return Err(FilestoreError::IsNotFile);
            }
            let mut file = OpenOptions::new().write(true).open(file)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
            Ok(())
        }

        fn is_file(&self, str_path: &str) -> Result<bool, FilestoreError> {
            let path = Path::new(str_path);
            if !self.exists(str_path)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            Ok(path.is_file())
        }

        fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
            let path = Path::new(path);
            Ok(self.exists_internal(path))
        }

        fn file_size(&self, str_path: &str) -> Result<u64, FilestoreError> {
            let path = Path::new(str_path);
            if !self.exists_internal(path) {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !path.is_file() {
                return Err(FilestoreError::IsNotFile);
            }
            Ok(path.metadata()?.len())
        }

        fn calculate_checksum(
            &self,
            file_path: &str,
            checksum_type: ChecksumType,
            size_to_verify: u64,
            verification_buf: &mut [u8],
        ) -> Result<u32, FilestoreError> {
            let mut calc_with_crc_lib = |crc: Crc<u32>| -> Result<u32, FilestoreError> {
                let mut digest = crc.digest();
                let mut buf_reader = BufReader::new(File::open(file_path)?);
                let mut remaining_bytes = size_to_verify;
                while remaining_bytes > 0 {
                    // Read the smaller of the remaining bytes or the buffer size
                    let bytes_to_read = remaining_bytes.min(verification_buf.len() as u64) as usize;
                    let bytes_read = buf_reader.read(&mut verification_buf[0..bytes_to_read])?;

                    if bytes_read == 0 {
                        break; // Reached end of file
                    }
                    digest.update(&verification_buf[0..bytes_read]);
                    remaining_bytes -= bytes_read as u64;
                }
                Ok(digest.finalize())
            };
            match checksum_type {
                ChecksumType::Modular => self.calc_modular_checksum(file_path),
                ChecksumType::Crc32 => calc_with_crc_lib(CRC_32),
                ChecksumType::Crc32C => calc_with_crc_lib(CRC_32C),
                ChecksumType::NullChecksum => Ok(0),
                _ => Err(FilestoreError::ChecksumTypeNotImplemented(checksum_type)),
            }
        }

        fn filename_from_full_path(path: &str) -> Option<&str>
        where
            Self: Sized,
        {
            Path::new(path).file_name().and_then(|name| name.to_str())
        }
    }

    impl NativeFilestore {
        pub fn calc_modular_checksum(&self, file_path: &str) -> Result<u32, FilestoreError> {
            let mut checksum: u32 = 0;
            let file = File::open(file_path)?;
            let mut buf_reader = BufReader::new(file);
            let mut buffer = [0; 4];

            loop {
                let bytes_read = buf_reader.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                // Perform padding directly in the buffer
                (bytes_read..4).for_each(|i| {
                    buffer[i] = 0;
                });

                checksum = checksum.wrapping_add(u32::from_be_bytes(buffer));
            }
            Ok(checksum)
        }

        fn exists_internal(&self, path: &Path) -> bool {
            if !path.exists() {
                return false;
            }
            true
        }
    }

    /// Wrapper around another [VirtualFilestore] implementation which constrains all file
    /// accesses to a configured root directory.
    ///
    /// Relative paths are joined to the root directory, and absolute paths are re-anchored
    /// below it while keeping their structure. Any path whose parent directory traversal would
    /// lexically escape the root directory is rejected with
    /// [FilestoreError::PathEscapesRootDir].
    pub struct RestrictedFilestore<Vfs: VirtualFilestore> {
        vfs: Vfs,
        root_dir: PathBuf,
    }

    impl<Vfs: VirtualFilestore> RestrictedFilestore<Vfs> {
        pub fn new(vfs: Vfs, root_dir: impl Into<PathBuf>) -> Self {
            Self {
                vfs,
                root_dir: root_dir.into(),
            }
        }

        pub fn root_dir(&self) -> &Path {
            &self.root_dir
        }

        /// Map a user supplied path below the root directory.
        ///
        /// The mapping is purely lexical, parent directory components are resolved without
        /// touching the filesystem.
        fn map_path(&self, path: &str) -> Result<PathBuf, FilestoreError> {
            let mut mapped = self.root_dir.clone();
            let mut depth = 0_usize;
            for component in Path::new(path).components() {
                match component {
                    Component::RootDir | Component::Prefix(_) | Component::CurDir => (),
                    Component::ParentDir => {
                        if depth == 0 {
                            return Err(FilestoreError::PathEscapesRootDir);
                        }
                        depth -= 1;
                        mapped.pop();
                    }
                    Component::Normal(part) => {
                        depth += 1;
                        mapped.push(part);
                    }
                }
            }
            Ok(mapped)
        }

        fn with_mapped_path<T>(
            &self,
            path: &str,
            op: impl FnOnce(&str) -> Result<T, FilestoreError>,
        ) -> Result<T, FilestoreError> {
            let mapped = self.map_path(path)?;
            op(mapped.to_str().ok_or(FilestoreError::Utf8Error)?)
        }

        fn with_two_mapped_paths<T>(
            &self,
            first: &str,
            second: &str,
            op: impl FnOnce(&str, &str) -> Result<T, FilestoreError>,
        ) -> Result<T, FilestoreError> {
            let first_mapped = self.map_path(first)?;
            let second_mapped = self.map_path(second)?;
            op(
                first_mapped.to_str().ok_or(FilestoreError::Utf8Error)?,
                second_mapped.to_str().ok_or(FilestoreError::Utf8Error)?,
            )
        }
    }

    impl<Vfs: VirtualFilestore> VirtualFilestore for RestrictedFilestore<Vfs> {
        fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            self.with_mapped_path(file_path, |path| self.vfs.create_file(path))
        }

        fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            self.with_mapped_path(file_path, |path| self.vfs.remove_file(path))
        }

        fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            self.with_mapped_path(file_path, |path| self.vfs.truncate_file(path))
        }

        fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError> {
            self.with_mapped_path(dir_path, |path| self.vfs.remove_dir(path, all))
        }

        fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError> {
            self.with_mapped_path(dir_path, |path| self.vfs.create_dir(path))
        }

        fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError> {
            self.with_two_mapped_paths(old_path, new_path, |old, new| {
                self.vfs.rename_file(old, new)
            })
        }

        fn append_file(&self, file_path: &str, file_to_append: &str) -> Result<(), FilestoreError> {
            self.with_two_mapped_paths(file_path, file_to_append, |first, second| {
                self.vfs.append_file(first, second)
            })
        }

        fn replace_file(
            &self,
            replaced_file: &str,
            source_file: &str,
        ) -> Result<(), FilestoreError> {
            self.with_two_mapped_paths(replaced_file, source_file, |first, second| {
                self.vfs.replace_file(first, second)
            })
        }

        fn read_data(
            &self,
            file_path: &str,
            offset: u64,
            read_len: u64,
            buf: &mut [u8],
        ) -> Result<(), FilestoreError> {
            self.with_mapped_path(file_path, |path| {
                self.vfs.read_data(path, offset, read_len, buf)
            })
        }

        fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError> {
            self.with_mapped_path(file, |path| self.vfs.write_data(path, offset, buf))
        }

        fn filename_from_full_path(path: &str) -> Option<&str>
        where
            Self: Sized,
        {
            Vfs::filename_from_full_path(path)
        }

        fn is_file(&self, path: &str) -> Result<bool, FilestoreError> {
            self.with_mapped_path(path, |path| self.vfs.is_file(path))
        }

        fn is_dir(&self, path: &str) -> Result<bool, FilestoreError> {
            self.with_mapped_path(path, |path| self.vfs.is_dir(path))
        }

        fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
            self.with_mapped_path(path, |path| self.vfs.exists(path))
        }

        fn file_name<'a>(&self, full_path: &'a str) -> Result<Option<&'a str>, FilestoreError> {
            self.vfs.file_name(full_path)
        }

        fn file_size(&self, path: &str) -> Result<u64, FilestoreError> {
            self.with_mapped_path(path, |path| self.vfs.file_size(path))
        }

        fn calculate_checksum(
            &self,
            file_path: &str,
            checksum_type: ChecksumType,
            size_to_verify: u64,
            verification_buf: &mut [u8],
        ) -> Result<u32, FilestoreError> {
            self.with_mapped_path(file_path, |path| {
                self.vfs
                    .calculate_checksum(path, checksum_type, size_to_verify, verification_buf)
            })
        }
    }
}
