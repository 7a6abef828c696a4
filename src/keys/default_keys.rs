//! Bundled key table used when no `aes_keys.txt` is present. The table is
//! stored AES-CBC encrypted with a zero key and IV to keep the key material
//! out of casual string dumps of the binary.

use hex_literal::hex;

pub const DEFAULT_KEYS_ENC: [u8; 576] = hex!(
    "3d8f783416c4f7f953eabcec5802ad1a886d5d596158af671d7a9ed6cff895d9"
    "885425dc820747d9087874e2bb6f4cbef6e8d842414020b4c2488c2371e15f18"
    "f0b3edf7f7f34a8964817ba05d24f30df4547da7846a63b8e7a743f6a39b5ea2"
    "14fff2237bb5c6cd30c05de351d0f83ef5194ca28219d921c1e3cb7e84e9f63e"
    "1cd38633451483ec3b06ee33c4b4b533fb6e375fbde7c42f8a11e6857a447448"
    "6daca431494c66c022d168009ab469b7e11ef8e11fd55383bf1956255f76f6fa"
    "49f5f8efc1b9ba3de427c0280e10ac36628becea491e322b6c808c187c9b6698"
    "05be92a1af1f318919f0b5c5cc4e77c9666a5089a258cc28a68d4298dbdd441d"
    "366f0507ae6018e796e35a6b738e90ba7622d1c343bbf4fcf62aa14f3bea0343"
    "7e99a43e0edec0f305f4adb84298c1e71efd8c4e6ef2ba2a29da83b15e5a99dc"
    "945165b5a83804767fe1ec1e0a93812819d1e97bbc206b8721ee83718a7ec74d"
    "fa2effd316d88eb177d11e9d4abe633bdac83c936c74f6e50910bffa3d79ea5c"
    "3e5ba649e599a33f24ed0254e1050a5264e4ae59231798b3cf0317cd147dc38e"
    "670505e361694fd049e0df7fae6130763ebc3da3e1df53824409edb7ad609a4e"
    "29777b88794468d546105eac737d70f6d9360eb63fda4890df9cfe280aadf64b"
    "20aeac4c2315395c1300730eb4f954ea6874573e8b58e4d0a3512e7901bc4c2b"
    "46de4702206d334b070dc4df7624857199cb2279a7cfede4e9d2ff304a045498"
    "d79e1929b78163e048ddafa7d6735765a84d67be5df016c1a89bcad126496c9d"
);
